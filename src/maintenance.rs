//! The background loop that detects supervisor death and drives the
//! idle-save / auto-save scans across every live broker's sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::context::AppContext;

const TICK: Duration = Duration::from_secs(1);
const IDLE_SAVE_AFTER: Duration = Duration::from_secs(30);
const AUTO_SAVE_AFTER: Duration = Duration::from_secs(300);

/// Run until the supervisor dies or the process-wide cancellation token
/// fires, whichever comes first.
pub async fn run(ctx: Arc<AppContext>) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        if let Some(status) = ctx.supervisor.poll_exit().await {
            log::warn!("supervisor exited ({status:?}), initiating shutdown");
            ctx.cancel.cancel();
            return;
        }

        scan_sessions(&ctx).await;

        tokio::select! {
            () = sleep(TICK) => {},
            () = ctx.cancel.cancelled() => return,
        }
    }
}

async fn scan_sessions(ctx: &AppContext) {
    for broker in ctx.registry.all_brokers().await {
        for session in broker.sessions_snapshot().await {
            let (queue, should_idle_save, should_auto_save) = {
                let mut guard = session.lock().await;
                let Some(queue) = guard.queue.clone() else { continue };

                let now = Instant::now();
                let idle = guard.last_message_time > guard.idle_save_time
                    && now.duration_since(guard.last_message_time) > IDLE_SAVE_AFTER;
                let auto = guard.last_message_time >= guard.idle_save_time
                    && guard.last_message_time >= guard.auto_save_time
                    && now.duration_since(guard.auto_save_time) > AUTO_SAVE_AFTER;

                if idle {
                    guard.idle_save_time = now;
                }
                if auto {
                    guard.auto_save_time = now;
                }
                (queue, idle, auto)
            };

            if should_idle_save {
                log::debug!("idle-save triggered for session {}", broker.key);
                queue.put("uno .uno:Save").await;
            } else if should_auto_save {
                log::debug!("auto-save triggered for session {}", broker.key);
                queue.put("uno .uno:Save").await;
            }
        }
    }
}
