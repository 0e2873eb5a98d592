use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use sql_coordinator::callbacks::{ActionKind, TransactionCallbacks};
use sql_coordinator::memory::MemoryFactory;
use sql_coordinator::transaction::TransactionOptions;
use sql_coordinator::{ConnectionPool, Outcome, PoolConfig, RowValues, SqlCoordinatorError};

use crate::args::SimConfig;
use crate::logging::EventLog;
use crate::model::{Ledger, Op, TaskState};
use crate::oracle::Oracle;
use crate::scheduler::Scheduler;

/// Tasks run one step at a time, so a checkout that finds the pool full can only time out.
const CHECKOUT_WAIT: Duration = Duration::from_millis(1);

struct World {
    pool: ConnectionPool,
    factory: MemoryFactory,
    ledger: Ledger,
    callbacks: Arc<TransactionCallbacks>,
}

pub(crate) async fn run(config: SimConfig, rng: &mut ChaCha8Rng) -> Result<(), String> {
    let factory = MemoryFactory::new();
    let pool_config = PoolConfig::builder()
        .max_size(config.pool_size)
        .checkout_timeout(CHECKOUT_WAIT)
        .build()
        .map_err(|e| e.to_string())?;
    let pool =
        ConnectionPool::new(pool_config, Arc::new(factory.clone())).map_err(|e| e.to_string())?;
    let ledger = Ledger::default();
    let world = World {
        pool,
        factory,
        callbacks: ledger.callbacks(),
        ledger,
    };

    let mut tasks: Vec<TaskState> = (0..config.tasks).map(TaskState::new).collect();
    let mut scheduler = Scheduler::new(config.tasks);
    let mut events = EventLog::new(config.first_steps, config.tail_steps);

    let max_steps = config.iterations.unwrap_or(u64::MAX);
    let max_time = config.duration_ms.unwrap_or(u64::MAX);

    let mut step: u64 = 0;
    while step < max_steps && scheduler.now_ms() <= max_time {
        let Some(task_id) = scheduler.next(rng) else {
            break;
        };
        let op = next_op(&tasks[task_id], &config, rng);
        let conn_before = tasks[task_id].conn_id();

        let outcome = apply(&world, &mut tasks[task_id], op).await;
        let result_label = match outcome {
            Ok(label) => label,
            Err(reason) => {
                events.dump_failure(&reason);
                return Err(reason);
            }
        };
        if let Op::Sleep(ms) = op {
            scheduler.park(task_id, ms);
        } else {
            scheduler.requeue(task_id);
        }

        let conn_label = tasks[task_id]
            .conn_id()
            .or(conn_before)
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        events.record(format!(
            "step={step} time={}ms task={task_id} op={op:?} conn={conn_label} result={result_label}",
            scheduler.now_ms()
        ));

        if let Err(reason) = Oracle::check(&tasks, &world.pool, &world.ledger) {
            events.dump_failure(&reason);
            return Err(reason);
        }
        scheduler.tick();
        step += 1;
    }

    for task in &mut tasks {
        task.scopes.clear();
        task.conn = None;
    }
    if let Err(reason) = Oracle::check_drained(&world.pool, &world.ledger) {
        events.dump_failure(&reason);
        return Err(reason);
    }

    tracing::info!(
        "complete: steps={} time={}ms tasks={} pool_size={} sessions={} participants={}",
        step,
        scheduler.now_ms(),
        config.tasks,
        config.pool_size,
        world.factory.connections_opened(),
        world.ledger.registered()
    );
    Ok(())
}

/// Run one op. `Ok` carries the label for the step log; `Err` is an invariant violation.
async fn apply(world: &World, task: &mut TaskState, op: Op) -> Result<String, String> {
    match op {
        Op::Sleep(_) => Ok("Ok".into()),
        Op::KillSessions => {
            world.factory.faults().kill_all();
            Ok("Ok".into())
        }
        Op::FailNextCommit => {
            world.factory.faults().fail_next_commit();
            Ok("Ok".into())
        }
        Op::Checkout => {
            let before = world.pool.stats();
            match world.pool.checkout_timeout(CHECKOUT_WAIT).await {
                Ok(conn) => {
                    task.conn = Some(conn);
                    Ok("Ok".into())
                }
                Err(SqlCoordinatorError::ConnectionTimeout { .. })
                    if before.leased == before.max_size =>
                {
                    Ok("Err(pool exhausted)".into())
                }
                Err(e) => Err(format!("checkout failed with {} of {} leased: {e}", before.leased, before.max_size)),
            }
        }
        Op::Return => {
            task.scopes.clear();
            task.conn = None;
            Oracle::check_settled(task, &world.ledger)?;
            task.participants.clear();
            Ok("Ok".into())
        }
        Op::Begin { savepoint } => {
            let conn = leased(task)?;
            let options = if savepoint {
                TransactionOptions::new().requiring_new()
            } else {
                TransactionOptions::new()
            };
            match conn.begin_transaction(&options).await {
                Ok(scope) => {
                    task.scopes.push(scope);
                    Ok(format!("Ok({scope:?})"))
                }
                Err(e) => Ok(format!("Err({e})")),
            }
        }
        Op::Commit | Op::Rollback => {
            let outcome = if matches!(op, Op::Commit) {
                Outcome::Commit
            } else {
                Outcome::Rollback
            };
            let Some(scope) = task.scopes.pop() else {
                return Err(format!("task {} closed a scope it never opened", task.id));
            };
            let conn = leased(task)?;
            let label = match conn.close(scope, outcome).await {
                Ok(report) => format!("Ok(notified={})", report.notified),
                Err(SqlCoordinatorError::ExecutionError(msg)) => {
                    return Err(format!("closing innermost scope was rejected: {msg}"));
                }
                Err(e) => format!("Err({e})"),
            };
            if task.scopes.is_empty() {
                Oracle::check_settled(task, &world.ledger)?;
                task.participants.clear();
            }
            Ok(label)
        }
        Op::Register(action) => {
            let id = task.next_participant_id();
            world.ledger.register(&id);
            let conn = leased(task)?;
            conn.register_participant(id.as_str(), action, Arc::clone(&world.callbacks))
                .map_err(|e| format!("register {id} failed inside an open frame: {e}"))?;
            task.participants.push(id);
            Ok("Ok".into())
        }
        Op::Execute => {
            let binds = [RowValues::Int(task.id as i64)];
            let conn = leased(task)?;
            Ok(label(
                conn.execute("UPDATE sim SET n = n + 1 WHERE id = ?", &binds)
                    .await
                    .map(drop),
            ))
        }
        Op::Select => {
            let binds = [RowValues::Int(task.id as i64)];
            let conn = leased(task)?;
            Ok(label(
                conn.select_all("SELECT n FROM sim WHERE id = ?", &binds)
                    .await
                    .map(drop),
            ))
        }
    }
}

fn leased(task: &mut TaskState) -> Result<&mut sql_coordinator::Connection, String> {
    let id = task.id;
    task.conn
        .as_deref_mut()
        .ok_or_else(|| format!("task {id} used a connection it does not hold"))
}

fn label(result: Result<(), SqlCoordinatorError>) -> String {
    match result {
        Ok(()) => "Ok".into(),
        Err(e) => format!("Err({e})"),
    }
}

fn next_op(task: &TaskState, config: &SimConfig, rng: &mut ChaCha8Rng) -> Op {
    if rng.random::<f64>() < config.sleep_rate {
        return Op::Sleep(rng.random_range(1..=50));
    }
    if rng.random::<f64>() < config.kill_rate {
        return Op::KillSessions;
    }
    if rng.random::<f64>() < config.commit_failure_rate {
        return Op::FailNextCommit;
    }

    if task.conn.is_none() {
        return Op::Checkout;
    }

    let savepoint = rng.random::<f64>() < config.savepoint_rate;
    if task.scopes.is_empty() {
        let weights = [
            (Op::Execute, 0.25),
            (Op::Select, 0.25),
            (Op::Begin { savepoint }, 0.30),
            (Op::Return, 0.20),
        ];
        return choose_weighted(&weights, rng);
    }

    let action = match rng.random_range(0..3) {
        0 => ActionKind::Create,
        1 => ActionKind::Update,
        _ => ActionKind::Destroy,
    };
    let mut weights = vec![
        (Op::Execute, 0.25),
        (Op::Select, 0.15),
        (Op::Register(action), 0.20),
        (Op::Commit, 0.14),
        (Op::Rollback, 0.08),
        (Op::Return, 0.02),
    ];
    if task.scopes.len() < config.max_depth {
        weights.push((Op::Begin { savepoint }, 0.16));
    }
    choose_weighted(&weights, rng)
}

fn choose_weighted(items: &[(Op, f64)], rng: &mut ChaCha8Rng) -> Op {
    let total: f64 = items.iter().map(|(_, weight)| weight.max(0.0)).sum();
    if total <= f64::EPSILON {
        return items.first().map_or(Op::Sleep(1), |(op, _)| *op);
    }
    let mut target = rng.random::<f64>() * total;
    for (op, weight) in items {
        let w = weight.max(0.0);
        if target <= w {
            return *op;
        }
        target -= w;
    }
    items.last().map_or(Op::Sleep(1), |(op, _)| *op)
}
