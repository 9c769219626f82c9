use clap::Parser;
use gpustack_common::{BudgetConstraint, DeploymentType, PhaseOutcome};
use gpustack_orchestrator::cli::{Cli, Command, DeployArgs, PricesArgs};
use gpustack_orchestrator::collector::Collector;
use gpustack_orchestrator::config::Settings;
use gpustack_orchestrator::cost_report::CostReport;
use gpustack_orchestrator::health_check::{render_matrix, HealthValidator};
use gpustack_orchestrator::interruption_monitor::MonitorOutcome;
use gpustack_orchestrator::monitoring::watch_for_external_teardown;
use gpustack_orchestrator::provider_manager::ProviderManager;
use gpustack_orchestrator::selection::rank;
use gpustack_orchestrator::state_machine::{
    CleanupOutcome, DeployFailure, DeployOutcome, DeployRequest, Orchestrator,
};
use gpustack_orchestrator::state_store::StateStore;
use gpustack_orchestrator::teardown::render_report;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Our crates at info, dependencies silent unless RUST_LOG says otherwise.
const DEFAULT_LOG_FILTER: &str = "gpustack=info";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Command::Deploy(args) => deploy(settings, args).await,
        Command::Prices(args) => prices(settings, args).await,
        Command::Status { stack_name } => status(&settings, &stack_name),
        Command::Health { stack_name } => health(&settings, &stack_name).await,
    };
    std::process::exit(code);
}

fn store_for(settings: &Settings) -> StateStore {
    StateStore::new(settings.state_dir.clone())
}

async fn deploy(settings: Arc<Settings>, args: DeployArgs) -> i32 {
    let collab = match ProviderManager::build(&settings) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return 1;
        }
    };
    let store = store_for(&settings);

    // first ctrl-c cancels at the next phase boundary (or detaches the monitors)
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_tx = Arc::new(cancel_tx);
    let signal_tx = cancel_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("🛑 interrupt received, stopping");
            let _ = signal_tx.send(true);
        }
    });

    let orchestrator = Orchestrator::new(settings.clone(), collab, store.clone(), cancel_rx.clone());

    if args.cleanup {
        return match orchestrator.cleanup(&args.stack_name).await {
            Ok(CleanupOutcome::NothingToDo) => 0,
            Ok(CleanupOutcome::Released { report, archived_to }) => {
                print!("{}", render_report(&report));
                if let Some(path) = archived_to {
                    println!("📦 state archived to {}", path.display());
                }
                0
            }
            Err(failure) => report_failure(&failure),
        };
    }

    let request = DeployRequest {
        stack_name: args.stack_name.clone(),
        deployment_type: args.deployment_type.into(),
        max_price: settings.resolve_max_price(args.budget_tier, args.max_price),
        regions: settings.regions_for(args.region.as_deref(), args.cross_region),
        validate_only: args.validate_only,
    };

    match orchestrator.deploy(&request).await {
        Ok(DeployOutcome::Validated { selection }) => {
            println!(
                "✅ validated {} in {} (budget ${:.4}/h)",
                selection.chosen.instance_type, selection.chosen.availability_zone, selection.final_budget
            );
            0
        }
        Ok(DeployOutcome::Monitoring { state, health, handle }) => {
            print!("{}", render_matrix(&health));
            println!(
                "✅ {} is up at {}; monitoring (ctrl-c to detach)",
                state.stack_name,
                state.public_address.as_deref().unwrap_or("-")
            );
            if !handle.has_interruption_monitor() && !handle.has_revalidation() {
                return 0;
            }
            tokio::spawn(watch_for_external_teardown(
                store.clone(),
                state.stack_name.clone(),
                Duration::from_secs(15),
                cancel_tx.clone(),
            ));
            match handle.wait(cancel_rx).await {
                Some(MonitorOutcome::Interrupted) => {
                    record_interruption(&store, &state.stack_name);
                    println!(
                        "⚠️ {} was reclaimed; workload stopped. Run `gpustack deploy {} --cleanup` to release resources.",
                        state.stack_name, state.stack_name
                    );
                    0
                }
                Some(MonitorOutcome::ResourceGone) => {
                    println!("ℹ️ instance for {} is gone, monitoring stopped", state.stack_name);
                    0
                }
                Some(MonitorOutcome::Cancelled) | None => {
                    println!("👋 detached from {}; resources stay up", state.stack_name);
                    0
                }
            }
        }
        Err(failure) => report_failure(&failure),
    }
}

fn record_interruption(store: &StateStore, stack_name: &str) {
    match store.load(stack_name) {
        Ok(Some(mut state)) => {
            state.complete_current(PhaseOutcome::Failed("spot interruption".to_string()));
            if let Err(e) = store.save(&state) {
                eprintln!("⚠️ cannot persist interruption: {}", e);
            }
        }
        Ok(None) => {}
        Err(e) => eprintln!("⚠️ cannot read state: {}", e),
    }
}

fn report_failure(failure: &DeployFailure) -> i32 {
    eprintln!(
        "❌ failed in {}: {} ({})",
        failure.phase,
        failure.error,
        failure.error.kind()
    );
    if let Some(health) = &failure.health {
        eprint!("{}", render_matrix(health));
    }
    if let Some(report) = &failure.teardown {
        eprintln!(
            "teardown: {}/{} released",
            report.attempted() - report.failed_count(),
            report.attempted()
        );
        eprint!("{}", render_report(report));
    }
    failure.exit_code()
}

async fn prices(settings: Arc<Settings>, args: PricesArgs) -> i32 {
    let collab = match ProviderManager::build(&settings) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return 1;
        }
    };
    let deployment_type: DeploymentType = args.deployment_type.into();
    let types = settings.instance_types_for(deployment_type);
    let regions = settings.regions_for(args.region.as_deref(), args.cross_region);
    let max_price = settings.resolve_max_price(args.budget_tier, args.max_price);

    let collection = Collector::new(collab.provider.as_ref(), &settings)
        .collect(&types, &regions, deployment_type.market())
        .await;
    for w in &collection.warnings {
        eprintln!("⚠️ {}", w);
    }
    if collection.candidates.is_empty() {
        eprintln!("❌ no candidates in {}", regions.join(", "));
        return 1;
    }
    let budget = match BudgetConstraint::new(max_price, settings.budget.margin_fraction) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("❌ {}", e);
            return 1;
        }
    };

    println!(
        "{:<14} {:<8} {:<12} {:>9} {:>8}  budget",
        "type", "arch", "zone", "$/h", "score"
    );
    for r in rank(&collection.candidates, &budget, &settings.architecture_preference) {
        let c = &r.candidate;
        println!(
            "{:<14} {:<8} {:<12} {:>9.4} {:>8.1}  {}",
            c.instance_type,
            c.architecture.as_str(),
            c.availability_zone,
            c.hourly_price,
            r.score,
            if r.within_budget { "yes" } else { "no" }
        );
    }
    let report = CostReport::build(&collection.candidates, budget.effective_max_price());
    if !report.lines.is_empty() {
        println!();
        print!("{}", report.render());
    }
    0
}

fn status(settings: &Settings, stack_name: &str) -> i32 {
    let state = match store_for(settings).load(stack_name) {
        Ok(Some(s)) => s,
        Ok(None) => {
            println!("no state for {}", stack_name);
            return 1;
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            return 1;
        }
    };
    println!(
        "{} ({}) phase={} started={}",
        state.stack_name,
        state.deployment_type.as_str(),
        state.phase,
        state.started_at.to_rfc3339()
    );
    for record in &state.phase_history {
        let outcome = match &record.outcome {
            PhaseOutcome::InProgress => "in progress".to_string(),
            PhaseOutcome::Succeeded => "ok".to_string(),
            PhaseOutcome::Failed(why) => format!("failed: {}", why),
        };
        println!("  {:<16} {} {}", record.phase.as_str(), record.at.to_rfc3339(), outcome);
    }
    if let Some(sel) = &state.selection {
        println!(
            "instance: {} in {} at ${:.4}/h{}",
            sel.chosen.instance_type,
            sel.chosen.availability_zone,
            sel.chosen.hourly_price,
            if sel.budget_adjusted { " (budget relaxed)" } else { "" }
        );
    }
    for r in &state.resource_ids {
        println!("  resource {}", r);
    }
    if let Some(err) = &state.last_error {
        println!("last error in {}: {} ({})", err.phase, err.message, err.kind);
    }
    0
}

async fn health(settings: &Settings, stack_name: &str) -> i32 {
    let host = match store_for(settings).load(stack_name) {
        Ok(Some(state)) => match state.public_address {
            Some(h) => h,
            None => {
                eprintln!("❌ {} has no public address recorded", stack_name);
                return 1;
            }
        },
        Ok(None) => {
            eprintln!("❌ no state for {}", stack_name);
            return 1;
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            return 1;
        }
    };
    let collab = match ProviderManager::build(settings) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return 1;
        }
    };
    let matrix = HealthValidator::from_settings(collab.probe, &settings.health)
        .validate(&host)
        .await;
    print!("{}", render_matrix(&matrix));
    if matrix.overall_healthy() {
        0
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn default_filter_covers_only_our_crates() {
        let subscriber = tracing_subscriber::registry().with(EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(target: "gpustack_orchestrator::state_machine", Level::INFO));
            assert!(tracing::enabled!(target: "gpustack_providers::aws", Level::WARN));
            assert!(!tracing::enabled!(target: "gpustack_orchestrator::collector", Level::DEBUG));
            assert!(!tracing::enabled!(target: "hyper::proto", Level::INFO));
            assert!(!tracing::enabled!(target: "reqwest::connect", Level::INFO));
        });
    }
}
