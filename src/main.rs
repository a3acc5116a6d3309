use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::warn;

use wotrack::api::{CachedApiClient, Checkout, TimeEntry, WorkOrder, WorkOrderStatus};
use wotrack::cache::CacheSource;
use wotrack::config::Config;
use wotrack::dashboard::Dashboard;
use wotrack::logging;
use wotrack::mutation::MutationOutcome;

#[derive(Parser, Debug)]
#[command(name = "wotrack")]
#[command(about = "Work-order tracking for CMMS backends")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/wotrack/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List work orders
  List {
    /// Only show orders with this status (e.g. in-progress)
    #[arg(short, long)]
    status: Option<WorkOrderStatus>,
  },
  /// List parts inventory
  Parts,
  /// Set the status of a work order
  Status { id: u64, status: WorkOrderStatus },
  /// Mark a work order in progress
  Start { id: u64 },
  /// Mark a work order completed
  Complete { id: u64 },
  /// Log time against a work order
  LogTime {
    id: u64,
    minutes: u32,
    #[arg(short, long)]
    note: Option<String>,
  },
  /// Assign a work order to a technician (default: yourself)
  Claim {
    id: u64,
    #[arg(short, long)]
    technician: Option<u64>,
  },
  /// Take parts out of inventory
  Checkout {
    part_id: u64,
    quantity: u32,
    /// Work order the parts are used for
    #[arg(short, long)]
    work_order: Option<u64>,
  },
  /// Forget all cached data
  Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let client = CachedApiClient::new(&config)?;
  let dashboard = Dashboard::new(client, config.mutations.same_key_policy);

  if let Command::Logout = args.command {
    return dashboard.logout();
  }

  let report = dashboard.load().await?;
  if report.work_orders == CacheSource::Offline || report.parts == CacheSource::Offline {
    eprintln!("offline: showing cached data");
  }

  let outcome = match args.command {
    Command::List { status } => {
      let orders = dashboard.work_orders();
      orders
        .iter()
        .filter(|order| status.map_or(true, |s| order.status == s))
        .for_each(print_work_order);
      return Ok(());
    }
    Command::Parts => {
      for part in dashboard.parts().iter() {
        println!(
          "{:>6}  {:<30}  {:>5}  {}",
          part.id,
          part.name,
          part.quantity_on_hand,
          part.part_number.as_deref().unwrap_or("-")
        );
      }
      return Ok(());
    }
    Command::Status { id, status } => dashboard.set_status(id, status).await,
    Command::Start { id } => dashboard.start(id).await,
    Command::Complete { id } => dashboard.complete(id).await,
    Command::LogTime { id, minutes, note } => {
      let entry = TimeEntry {
        minutes,
        note,
        technician_id: config.technician_id,
      };
      dashboard.log_time(id, entry).await
    }
    Command::Claim { id, technician } => {
      let technician = technician
        .or(config.technician_id)
        .ok_or_else(|| eyre!("No technician given and no technician_id in config"))?;
      dashboard.claim(id, technician).await
    }
    Command::Checkout {
      part_id,
      quantity,
      work_order,
    } => {
      let checkout = Checkout {
        quantity,
        work_order_id: work_order,
      };
      dashboard.checkout_part(part_id, checkout).await
    }
    Command::Logout => return Ok(()),
  };

  report_outcome(&dashboard, outcome).await
}

async fn report_outcome(dashboard: &Dashboard, outcome: MutationOutcome) -> Result<()> {
  match outcome {
    MutationOutcome::Confirmed { id } => {
      if let Err(e) = dashboard.refresh().await {
        warn!(error = %e, "refresh after {} failed", id);
      }
      println!("ok");
      Ok(())
    }
    MutationOutcome::Failed {
      id,
      error,
      rolled_back,
    } => {
      let note = if rolled_back { "changes reverted" } else { "refreshing from server" };
      Err(eyre!("{} failed ({}): {}", id, note, error))
    }
  }
}

fn print_work_order(order: &WorkOrder) {
  println!(
    "{:>6}  {:<12}  {:<40}  {:>5}m  {}",
    order.id,
    order.status.as_str(),
    order.title,
    order.time_spent_minutes,
    order.assignee_name.as_deref().unwrap_or("-")
  );
}
