//! Async driver for an [`Account`].
//!
//! The account itself is Sans-IO. [`run`] owns it on a single task, feeds it
//! events from a channel and forwards the resulting actions, so all session
//! mutations happen in order on one task.

use crate::{Account, AccountAction, AccountEvent, Error};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Processes events until the event channel closes.
///
/// Returns [`Error::TransportUnavailable`] once the action receiver is gone.
pub async fn run(
    mut account: Account,
    mut events: mpsc::Receiver<AccountEvent>,
    actions: mpsc::Sender<AccountAction>,
) -> Result<Account, Error> {
    info!(account = account.uuid(), "Account runtime started");

    while let Some(event) = events.recv().await {
        for action in account.handle(event) {
            debug!(?action, "Dispatching action");
            actions
                .send(action)
                .await
                .map_err(|_| Error::TransportUnavailable)?;
        }
    }

    info!(account = account.uuid(), "Event channel closed, stopping");
    Ok(account)
}
