use std::{sync::Arc, time::Duration};

use clap::Parser;
use cortex::fabric::{
    error::Error,
    system::{System, SystemConfig},
    task::{RandomFactory, TaskFactory, TemplateFactory},
};
use tokio::select;
use tracing::{error, info};

/// Simulates a multi-node shared memory machine and prints every node's
/// cache contents until interrupted.
#[derive(Parser)]
#[command(name = "cortex", version)]
struct Args {
    /// Number of nodes (1, 4, 8 or 16)
    #[arg(short, long)]
    nodes: usize,

    /// Seconds between cache reports
    #[arg(long, default_value_t = 1)]
    report_interval: u64,

    /// Milliseconds a worker waits between cycles
    #[arg(long, default_value_t = 1000)]
    cycle_ms: u64,

    /// Generate random programs instead of the fixed template
    #[arg(long)]
    random: bool,
}

/// Builds the system described by the arguments and starts its workers.
fn launch(args: &Args) -> Result<System, Error> {
    let factory: Arc<dyn TaskFactory> = if args.random {
        Arc::new(RandomFactory)
    } else {
        Arc::new(TemplateFactory::default())
    };
    let config = SystemConfig::builder()
        .node_count(args.nodes)
        .cycle_interval(Duration::from_millis(args.cycle_ms))
        .factory(factory)
        .build();

    let mut system = System::initialize(config)?;
    system.start()?;
    Ok(system)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut system = match launch(&args) {
        Ok(system) => system,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let mut reports = tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        select! {
            _ = reports.tick() => {
                println!("\n{}", system.report().await);
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    match system.request_stop().await {
        Ok(summary) => {
            for (node, released) in summary.released.iter().enumerate() {
                println!("stopped node {} ({} lines released)", node, released);
            }
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsupported_node_count_is_not_launched() {
        let args = Args::parse_from(["cortex", "--nodes", "3"]);
        assert_eq!(launch(&args).err(), Some(Error::InvalidNodeCount(3)));
    }

    #[tokio::test]
    async fn launched_system_runs_until_stopped() {
        let args = Args::parse_from(["cortex", "-n", "4", "--random"]);
        let mut system = launch(&args).unwrap();
        assert!(system.is_running());

        let summary = system.request_stop().await.unwrap();
        assert_eq!(summary.released.len(), 4);
    }
}
