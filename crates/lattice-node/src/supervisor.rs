//! Restart supervision around the node service.
//!
//! Most terminations are final, but an identity collision is recoverable:
//! the current identity is set aside, the on-disk identity files are
//! removed, and a fresh service instance regenerates them through the
//! engine. The supervisor owns that loop and translates terminal reasons
//! into node-level events.

use std::path::Path;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::events::{EventCode, EventPayload, EventSink};
use crate::service::{NodeService, ServiceDeps, Termination};

/// File name the colliding identity is preserved under.
pub const SAVED_IDENTITY_FILE: &str = "identity.secret.saved_after_collision";

/// Run the service, restarting from scratch after identity collisions.
///
/// `make_deps` is invoked once per service instance. The external
/// `shutdown` signal terminates the current instance and ends the loop;
/// `NODE_DOWN` is emitted once everything has stopped.
pub async fn run_supervised<F>(
    config: ServiceConfig,
    mut make_deps: F,
    events: EventSink,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServiceError>
where
    F: FnMut() -> ServiceDeps,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let service = NodeService::new(config.clone(), make_deps(), events.clone())?;
        let handle = service.handle();

        let stopper = handle.clone();
        let mut shutdown_watch = shutdown.clone();
        let watcher = tokio::spawn(async move {
            if shutdown_watch.changed().await.is_ok() {
                stopper.terminate();
            }
        });

        let reason = service.run().await;
        watcher.abort();

        match reason {
            Termination::StillRunning | Termination::NormalTermination => {
                events.send(EventCode::NodeNormalTermination, EventPayload::None);
                break;
            }
            Termination::UnrecoverableError => {
                error!("fatal error: {}", handle.fatal_error_message());
                events.send(EventCode::NodeUnrecoverableError, EventPayload::None);
                break;
            }
            Termination::IdentityCollision => {
                info!("identity collision, rotating identity and restarting");
                rotate_identity_after_collision(&config.home_path());
                events.send(EventCode::NodeIdentityCollision, EventPayload::None);
            }
        }
    }

    events.send(EventCode::NodeDown, EventPayload::None);
    Ok(())
}

/// Preserve the colliding secret identity and remove both identity files
/// so the next service instance generates a fresh pair.
pub fn rotate_identity_after_collision(home: &Path) {
    let secret_path = home.join("identity.secret");
    let old = match std::fs::read(&secret_path) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => return,
    };
    if let Err(e) = std::fs::write(home.join(SAVED_IDENTITY_FILE), &old) {
        warn!("could not preserve colliding identity: {e}");
        return;
    }
    if let Err(e) = std::fs::remove_file(&secret_path) {
        warn!("could not remove identity.secret: {e}");
    }
    if let Err(e) = std::fs::remove_file(home.join("identity.public")) {
        warn!("could not remove identity.public: {e}");
    }
}
