use anyhow::Result;
use clap::Parser;
use stackscan_cli::AnalyzeCommand;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    AnalyzeCommand::parse().execute()
}
