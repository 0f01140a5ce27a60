use clap::Subcommand;
use calbridge_core::storage::{RoutineStore, TaskStore};
use calbridge_core::ChangeKind;

use super::{runtime, CliResult, Context};

#[derive(Subcommand)]
pub enum TaskAction {
    /// List tasks with their calendar mapping
    List {
        #[arg(long)]
        json: bool,
    },
    /// Queue one task for the calendar and push it now
    Push { id: i64 },
}

#[derive(Subcommand)]
pub enum RoutineAction {
    /// List routines
    List,
    /// Rewrite a routine's upcoming occurrences now
    Push { id: i64 },
    /// Extend every routine window that is running out
    Refresh,
}

pub fn run(user: &str, action: TaskAction) -> CliResult {
    let ctx = Context::open()?;
    match action {
        TaskAction::List { json } => {
            let tasks = ctx.store.list_tasks(user)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(());
            }
            for task in tasks {
                let when = match (task.date, task.start_time) {
                    (Some(d), Some(t)) => format!("{d} {}", t.format("%H:%M")),
                    (Some(d), None) => d.to_string(),
                    _ => "-".to_string(),
                };
                let private = if task.private { " [private]" } else { "" };
                println!(
                    "{:>6}  {:<16}  {}{}  {}",
                    task.id,
                    when,
                    task.title,
                    private,
                    task.event_id.as_deref().unwrap_or("(not synced)")
                );
            }
        }
        TaskAction::Push { id } => {
            let task = ctx
                .store
                .get_task(id)?
                .filter(|t| t.user_id == user)
                .ok_or_else(|| format!("task {id} not found"))?;
            let change = if task.event_id.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Create
            };
            ctx.engine.sync_task_outbound(&task, change)?;
            let pushed = runtime()?.block_on(ctx.engine.run_outbound_now())?;
            println!("task {id} queued, {pushed} job(s) processed");
        }
    }
    Ok(())
}

pub fn run_routine(user: &str, action: RoutineAction) -> CliResult {
    let ctx = Context::open()?;
    match action {
        RoutineAction::List => {
            for routine in ctx.store.list_routines(user)? {
                let days = if routine.days.is_empty() {
                    "daily".to_string()
                } else {
                    routine
                        .days
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                };
                println!("{:>6}  {:<20}  {}", routine.id, days, routine.title);
            }
        }
        RoutineAction::Push { id } => {
            let routine = ctx
                .store
                .get_routine(id)?
                .filter(|r| r.user_id == user)
                .ok_or_else(|| format!("routine {id} not found"))?;
            ctx.engine.sync_routine_outbound(&routine, ChangeKind::Update)?;
            let pushed = runtime()?.block_on(ctx.engine.run_outbound_now())?;
            println!("routine {id} queued, {pushed} job(s) processed");
        }
        RoutineAction::Refresh => {
            let queued = ctx.engine.refresh_routine_windows()?;
            let pushed = runtime()?.block_on(ctx.engine.run_outbound_now())?;
            println!("{queued} routine(s) queued, {pushed} job(s) processed");
        }
    }
    Ok(())
}
