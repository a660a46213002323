//! `summit` ops CLI over a SQLite progress database

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use summit_engine::{telemetry, EngineConfig, ProgressEngine};
use summit_model::{
    Action, ActionId, ActionKind, EntityRef, EntityType, Goal, GoalId, SubGoal, SubGoalId, Task,
    TaskId, TaskStatus,
};
use summit_store::{ProgressStore, SqliteStore};

fn cli() -> Command {
    let entity_args = [
        Arg::new("entity-type")
            .required(true)
            .value_parser(value_parser!(EntityType))
            .help("goal, subgoal, action or task"),
        Arg::new("id").required(true).help("Entity ID"),
    ];

    Command::new("summit")
        .version(summit_engine::VERSION)
        .about("Hierarchical goal progress engine")
        .subcommand_required(true)
        .arg(
            Arg::new("db")
                .long("db")
                .global(true)
                .default_value("summit.sqlite3")
                .value_parser(value_parser!(PathBuf))
                .help("SQLite database file"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration (TOML)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Output as JSON"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(Command::new("init").about("Create the database schema"))
        .subcommand(Command::new("demo").about("Seed a sample goal hierarchy"))
        .subcommand(
            Command::new("progress")
                .about("Show progress of a goal, subgoal or action")
                .arg(Arg::new("id").required(true).help("Entity ID"))
                .arg(
                    Arg::new("level")
                        .long("level")
                        .default_value("goal")
                        .value_parser(value_parser!(EntityType))
                        .help("Level of the entity"),
                ),
        )
        .subcommand(
            Command::new("recalc")
                .about("Cascade a task change up to its goal")
                .arg(Arg::new("task").required(true).help("Task ID"))
                .arg(
                    Arg::new("status")
                        .long("status")
                        .value_parser(value_parser!(TaskStatus))
                        .help("Set the task status before cascading"),
                ),
        )
        .subcommand(
            Command::new("validate")
                .about("Check stored progress against recomputed values")
                .arg(Arg::new("goal").required(true).help("Goal ID"))
                .arg(
                    Arg::new("strict")
                        .long("strict")
                        .action(ArgAction::SetTrue)
                        .help("Exit non-zero on any discrepancy"),
                ),
        )
        .subcommand(
            Command::new("repair")
                .about("Rewrite discrepant progress values")
                .arg(Arg::new("goal").required(true).help("Goal ID")),
        )
        .subcommand(
            Command::new("batch")
                .about("Recompute and persist whole goal hierarchies")
                .arg(
                    Arg::new("goals")
                        .required(true)
                        .num_args(1..)
                        .help("Goal IDs"),
                ),
        )
        .subcommand(
            Command::new("trend")
                .about("Progress trend over recent history")
                .args(entity_args.clone())
                .arg(
                    Arg::new("days")
                        .long("days")
                        .default_value("30")
                        .value_parser(value_parser!(u32))
                        .help("Window in days"),
                ),
        )
        .subcommand(
            Command::new("changes")
                .about("Significant progress jumps in retained history")
                .args(entity_args)
                .arg(
                    Arg::new("threshold")
                        .long("threshold")
                        .value_parser(value_parser!(u8))
                        .help("Minimum absolute delta (defaults to config)"),
                ),
        )
        .subcommand(Command::new("cleanup").about("Purge history past the retention window"))
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    Ok(EngineConfig::from_toml_str(&source)?)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a String> {
    args.get_one::<String>(name)
        .with_context(|| format!("missing argument <{name}>"))
}

fn demo_goal() -> Goal {
    let mut goal = Goal::new();
    for (kind, done) in [(ActionKind::Execution, 2), (ActionKind::Habit, 4)] {
        let mut sub = SubGoal::new(goal.id.clone());
        let mut action = Action::new(sub.id.clone(), kind);
        for i in 0..5 {
            let status = if i < done {
                TaskStatus::Completed
            } else {
                TaskStatus::NotStarted
            };
            action.tasks.push(Task::new(action.id.clone(), status));
        }
        sub.actions.push(action);
        goal.sub_goals.push(sub);
    }
    goal
}

async fn open_store(path: &Path) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(path)
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let json = matches.get_flag("json");
    let config = load_config(matches.get_one::<PathBuf>("config"))?;
    let db = matches
        .get_one::<PathBuf>("db")
        .context("missing --db")?;
    let sqlite = open_store(db).await?;
    let store: Arc<dyn ProgressStore> = sqlite.clone();
    let engine = ProgressEngine::new(store, config)?;

    match matches.subcommand() {
        Some(("init", _)) => {
            println!("Initialized {}", db.display());
        }
        Some(("demo", _)) => {
            let goal = demo_goal();
            sqlite.insert_goal(&goal).await?;
            emit(json, &goal, |g| {
                let mut out = format!("Seeded goal {}", g.id);
                for task in g.actions().flat_map(|a| a.tasks.iter()) {
                    out.push_str(&format!("\n  task {} ({})", task.id, task.status));
                }
                out
            })?;
        }
        Some(("progress", args)) => {
            let id = required(args, "id")?;
            let level = args
                .get_one::<EntityType>("level")
                .copied()
                .unwrap_or(EntityType::Goal);
            let progress = match level {
                EntityType::Goal => engine.calculate_goal_progress(&GoalId::from(id.as_str())).await?,
                EntityType::SubGoal => {
                    engine
                        .calculate_sub_goal_progress(&SubGoalId::from(id.as_str()))
                        .await?
                }
                EntityType::Action => {
                    engine
                        .calculate_action_progress(&ActionId::from(id.as_str()))
                        .await?
                }
                EntityType::Task => bail!("tasks have a status, not a progress value"),
            };
            let entity = EntityRef::new(level, id.as_str());
            emit(
                json,
                &serde_json::json!({ "entity": entity, "progress": progress }),
                |_| format!("{entity}: {progress}%"),
            )?;
        }
        Some(("recalc", args)) => {
            let task_id = TaskId::from(required(args, "task")?.as_str());
            if let Some(status) = args.get_one::<TaskStatus>("status") {
                sqlite.set_task_status(&task_id, *status).await?;
            }
            let outcome = engine.recalculate_from_task(&task_id).await?;
            emit(json, &outcome, |o| {
                [&o.action, &o.sub_goal, &o.goal]
                    .iter()
                    .map(|c| format!("{}: {} -> {}", c.entity, c.previous, c.current))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Some(("validate", args)) => {
            let goal_id = GoalId::from(required(args, "goal")?.as_str());
            let report = engine.validate_data_integrity(&goal_id).await?;
            emit(json, &report, |r| {
                let mut out = format!(
                    "Goal {}: {}",
                    r.goal_id,
                    if r.is_valid { "VALID" } else { "INVALID" }
                );
                for d in &r.discrepancies {
                    out.push_str(&format!(
                        "\n  {} stored {} expected {} ({:?})",
                        d.entity, d.stored, d.expected, d.kind
                    ));
                }
                out
            })?;
            if args.get_flag("strict") {
                report.into_result()?;
            }
        }
        Some(("repair", args)) => {
            let goal_id = GoalId::from(required(args, "goal")?.as_str());
            let report = engine.repair_data_integrity(&goal_id).await?;
            emit(json, &report, |r| {
                if r.repaired {
                    format!("Repaired {} entities on goal {}", r.entities_fixed.len(), r.goal_id)
                } else {
                    format!("Goal {} needed no repair", r.goal_id)
                }
            })?;
        }
        Some(("batch", args)) => {
            let goal_ids: Vec<GoalId> = args
                .get_many::<String>("goals")
                .into_iter()
                .flatten()
                .map(|id| GoalId::from(id.as_str()))
                .collect();
            let report = engine.batch_update_progress(&goal_ids).await?;
            emit(json, &report, |r| {
                format!("Updated {} goals, {} missing", r.updated.len(), r.missing.len())
            })?;
        }
        Some(("trend", args)) => {
            let entity = entity_arg(args)?;
            let days = args.get_one::<u32>("days").copied().unwrap_or(30);
            let trend = engine.history().progress_trend(&entity, days).await?;
            emit(json, &trend, |t| {
                format!(
                    "{entity}: {:?} at {:.2}/entry (confidence {:.1})",
                    t.direction, t.rate, t.confidence
                )
            })?;
        }
        Some(("changes", args)) => {
            let entity = entity_arg(args)?;
            let threshold = args
                .get_one::<u8>("threshold")
                .copied()
                .unwrap_or(engine.config().significant_change_threshold);
            let changes = engine
                .history()
                .significant_changes(&entity, threshold)
                .await?;
            emit(json, &changes, |list| {
                list.iter()
                    .map(|c| format!("{} {:+} -> {}%", c.date.to_rfc3339(), c.change, c.progress))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Some(("cleanup", _)) => {
            let removed = engine.history().cleanup_old_history().await?;
            emit(json, &serde_json::json!({ "removed": removed }), |_| {
                format!("Removed {removed} history entries")
            })?;
        }
        _ => bail!("unknown command"),
    }
    Ok(())
}

fn entity_arg(args: &ArgMatches) -> Result<EntityRef> {
    let entity_type = args
        .get_one::<EntityType>("entity-type")
        .copied()
        .context("missing <entity-type>")?;
    Ok(EntityRef::new(entity_type, required(args, "id")?.as_str()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    telemetry::init_tracing(matches.get_flag("log-json"));
    run(&matches).await
}
