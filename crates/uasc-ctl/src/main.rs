//! uasc-ctl — exercise and inspect the secure conversation chunking layer.

mod cmd;

use anyhow::{Context, Result};

fn print_usage() {
    println!("Usage: uasc-ctl <command> [options]");
    println!();
    println!("Commands:");
    println!("  loopback <file>     Chunk a file as one MSG and reassemble it");
    println!("  inspect <file>      Frame a captured byte stream and list its chunks");
    println!("  config              Show the resolved configuration");
    println!("  config init         Write the default config file if missing");
    println!();
    println!("Options:");
    println!("  --policy <name|uri>   Security policy (loopback)");
    println!("  --mode <mode>         None, Sign or SignAndEncrypt (loopback)");
    println!("  --chunk-size <bytes>  Chunk size (loopback)");
    println!("  --json                Machine-readable output (inspect)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut overrides = cmd::loopback::Overrides::default();
    let mut json = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--policy" => {
                i += 1;
                overrides.policy = Some(args.get(i).context("--policy requires a value")?.clone());
            }
            "--mode" => {
                i += 1;
                overrides.mode = Some(args.get(i).context("--mode requires a value")?.clone());
            }
            "--chunk-size" => {
                i += 1;
                overrides.chunk_size = Some(
                    args.get(i)
                        .context("--chunk-size requires a value")?
                        .parse()
                        .context("--chunk-size must be a number")?,
                );
            }
            "--json" => json = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["loopback", path]             => cmd::loopback::cmd_loopback(path, overrides).await,
        ["inspect", path]              => cmd::inspect::cmd_inspect(path, json),
        ["config"]                     => cmd::config::cmd_config(),
        ["config", "init"]             => cmd::config::cmd_config_init(),
        ["help"] | ["--help"] | ["-h"] | [] => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
