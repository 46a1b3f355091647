use cropsyncd::daemon::{DaemonConfig, DaemonRuntime, clear_queue, status_report};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Clear,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--clear" => mode = CliMode::Clear,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cropsyncd=info".into()),
        )
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: cropsyncd [--status | --clear]");
        println!("  --status   Print pending operations and exit");
        println!("  --clear    Drop all pending operations and exit");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    match mode {
        CliMode::Status => println!("{}", status_report(&config).await?),
        CliMode::Clear => {
            let removed = clear_queue(&config).await?;
            println!("removed {removed} pending operation(s)");
        }
        CliMode::Run => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await?;
        }
        CliMode::Help => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&["cropsyncd"])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_status_and_clear() {
        assert_eq!(
            parse_cli_mode(args(&["cropsyncd", "--status"])).unwrap(),
            CliMode::Status
        );
        assert_eq!(
            parse_cli_mode(args(&["cropsyncd", "--clear"])).unwrap(),
            CliMode::Clear
        );
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(
            parse_cli_mode(args(&["cropsyncd", "-h"])).unwrap(),
            CliMode::Help
        );
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["cropsyncd", "--logout"])).is_err());
    }
}
