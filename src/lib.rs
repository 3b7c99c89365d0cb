pub mod actions;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod egress_dns;
pub mod firewall;
pub mod keys;
pub mod kube_watch;
pub mod memstore;
pub mod netid;
pub mod osdn;
pub mod proxy;
pub mod unidler;

use log::info;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use dispatch::{Dispatcher, SdnHandler};

pub struct Context {
    pub node_name: String,
    pub namespace: Option<String>,
    pub kube: kube::Client,
}

/// Feed the watch events to `handler` until the watches end or `stop` is cancelled.
pub async fn process_kube_events<H: SdnHandler>(
    handler: &H,
    watch_config: kube_watch::Config,
    event_buffer_size: usize,
    stop: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel(event_buffer_size);

    watch_config.watch_to(tx);

    let mut dispatcher = Dispatcher::new();

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => return,
            event = rx.recv() => event,
        };
        let Some(event) = event else {
            info!("all watches stopped");
            return;
        };

        dispatcher.dispatch(handler, event);

        // also consume the current event queue.
        // Don't process more than the requested buffer size as an heuristic on how many events we
        // want to consume before requesting a sync.
        for _ in 0..event_buffer_size {
            match rx.try_recv() {
                Ok(event) => dispatcher.dispatch(handler, event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        handler.sync();
    }
}
