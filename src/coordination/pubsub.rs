use anyhow::{Context, Result};
use fred::clients::SubscriberClient;
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{FetchEvent, FetchEvents};

pub(crate) fn events_channel(prefix: &str) -> String {
    format!("{prefix}:events:repo.fetched")
}

/// Publish the outcome of a fetch on the events channel.
pub async fn publish_event(
    pool: &fred::clients::Pool,
    prefix: &str,
    event: &FetchEvent,
) -> Result<()> {
    let payload = serde_json::to_string(event).context("encode fetch event")?;
    let _: () = pool
        .next()
        .publish(events_channel(prefix), payload.as_str())
        .await
        .context("publish fetch event")?;
    debug!(repo_id = %event.repo_id, outcome = ?event.outcome, "published fetch event");
    Ok(())
}

/// Subscribe to fetch events on a dedicated connection, which is closed
/// once the returned [`FetchEvents`] is dropped.
pub async fn subscribe_events(pool: &fred::clients::Pool, prefix: &str) -> Result<FetchEvents> {
    let channel = events_channel(prefix);

    let client = pool.next();
    let subscriber = SubscriberClient::new(
        client.client_config(),
        None,
        None,
        client.client_reconnect_policy(),
    );
    let _connect = subscriber.connect();
    subscriber
        .wait_for_connect()
        .await
        .context("subscriber connect")?;

    // Take the message stream before subscribing so nothing published right
    // after SUBSCRIBE returns is missed.
    let mut messages = subscriber.message_rx();
    subscriber
        .subscribe(&channel)
        .await
        .context("subscribe to events channel")?;

    let (tx, rx) = mpsc::channel::<FetchEvent>(64);
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                () = tx.closed() => break,
                msg = messages.recv() => match msg {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };
            let Some(payload) = msg.value.as_str() else {
                continue;
            };
            match serde_json::from_str::<FetchEvent>(&payload) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, %payload, "ignoring malformed fetch event"),
            }
        }
        if let Err(e) = subscriber.unsubscribe(&channel).await {
            debug!(error = %e, "unsubscribe from events channel failed");
        }
        if let Err(e) = subscriber.quit().await {
            debug!(error = %e, "closing subscriber connection failed");
        }
    });

    Ok(FetchEvents::new(rx))
}
