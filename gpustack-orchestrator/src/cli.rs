use clap::{Args, Parser, Subcommand, ValueEnum};
use gpustack_common::{validate_stack_name, DeploymentType};
use std::path::PathBuf;

use crate::config::BudgetTier;

#[derive(Debug, Parser)]
#[command(name = "gpustack", version, about = "Deploy a GPU container stack on the best-value instance")]
pub struct Cli {
    /// Settings file (TOML). Falls back to GPUSTACK_CONFIG, then built-in defaults.
    #[arg(long, global = true, env = "GPUSTACK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Select, provision, configure and health-check a stack, then monitor it.
    Deploy(DeployArgs),
    /// Collect and rank candidates without deploying.
    Prices(PricesArgs),
    /// Show the persisted state of a stack.
    Status {
        #[arg(value_parser = parse_stack_name)]
        stack_name: String,
    },
    /// Re-run the health checks against a deployed stack.
    Health {
        #[arg(value_parser = parse_stack_name)]
        stack_name: String,
    },
}

fn parse_stack_name(raw: &str) -> Result<String, String> {
    validate_stack_name(raw).map_err(|e| e.to_string())?;
    Ok(raw.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TypeArg {
    Spot,
    #[value(name = "ondemand", alias = "on-demand")]
    OnDemand,
    Simple,
}

impl From<TypeArg> for DeploymentType {
    fn from(t: TypeArg) -> Self {
        match t {
            TypeArg::Spot => DeploymentType::Spot,
            TypeArg::OnDemand => DeploymentType::OnDemand,
            TypeArg::Simple => DeploymentType::Simple,
        }
    }
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    #[arg(value_parser = parse_stack_name)]
    pub stack_name: String,

    #[arg(long = "type", value_enum, default_value = "spot")]
    pub deployment_type: TypeArg,

    #[arg(long, value_enum, conflicts_with = "max_price")]
    pub budget_tier: Option<BudgetTier>,

    /// Hourly price ceiling in USD.
    #[arg(long)]
    pub max_price: Option<f64>,

    #[arg(long)]
    pub region: Option<String>,

    /// Search every configured region instead of one.
    #[arg(long)]
    pub cross_region: bool,

    /// Stop after selection and commit-time validation.
    #[arg(long, conflicts_with = "cleanup")]
    pub validate_only: bool,

    /// Tear down the persisted stack instead of deploying.
    #[arg(long)]
    pub cleanup: bool,
}

#[derive(Debug, Args)]
pub struct PricesArgs {
    #[arg(long = "type", value_enum, default_value = "spot")]
    pub deployment_type: TypeArg,

    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub cross_region: bool,

    #[arg(long, value_enum, conflicts_with = "max_price")]
    pub budget_tier: Option<BudgetTier>,

    #[arg(long)]
    pub max_price: Option<f64>,
}
