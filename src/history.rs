use std::convert::Infallible;
use std::sync::Arc;

use warp::{Filter, Rejection, Reply};

use crate::messages::Message;
use crate::store::MessageStore;

/// Read-only view of the log for clients catching up before the realtime stream.
pub struct HistoryEndpoint {
    store: Arc<MessageStore>,
}

impl HistoryEndpoint {
    pub fn new(store: Arc<MessageStore>) -> Self {
        HistoryEndpoint { store }
    }

    pub async fn get_history(&self) -> Vec<Message> {
        self.store.snapshot().await
    }
}

/// `GET /messages`
pub fn routes(
    history: Arc<HistoryEndpoint>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone + Send + Sync + 'static {
    warp::path("messages")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&history)))
        .and_then(list_messages)
}

async fn list_messages(history: Arc<HistoryEndpoint>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&history.get_history().await))
}
