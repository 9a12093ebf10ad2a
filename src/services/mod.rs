use crate::config::Config;
use crate::db::Store;
use actix::prelude::*;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub mod broadcast;
pub mod poll;
pub mod token;
pub mod vote;

/// Addresses of the running service actors. Cloned into every HTTP worker
/// and display connection.
#[derive(Clone)]
pub struct Services {
    pub polls: Addr<poll::PollService>,
    pub tokens: Addr<token::TokenService>,
    pub votes: Addr<vote::VoteActor>,
    pub broadcast: Addr<broadcast::BroadcastActor>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish()
    }
}

impl Services {
    /// Starts every service actor on the current arbiter, sharing one store.
    pub fn start(store: Arc<dyn Store>, config: &Config) -> Self {
        let broadcast = broadcast::BroadcastActor::new().start();
        let polls = poll::PollService::new(store.clone(), broadcast.clone()).start();
        let tokens = token::TokenService::new(
            store.clone(),
            broadcast.clone(),
            config.token_ttl,
            config.token_sweep_interval,
        )
        .start();
        let votes = vote::VoteActor::new(store, broadcast.clone()).start();
        info!("Service actors started");
        Self {
            polls,
            tokens,
            votes,
            broadcast,
        }
    }
}
