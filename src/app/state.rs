//! Application state shared across routes

use std::sync::Arc;

use chrono::Duration;

use crate::config::game::GameConfig;
use crate::config::Config;
use crate::jobs::QueueManager;
use crate::rally::RallyPointEngine;
use crate::scheduler::{TickScheduler, TickSettings};
use crate::store::WorldStore;
use crate::util::rate_limit::ActionRateLimiter;
use crate::util::time::Clock;
use crate::world::{DistanceCache, PowerCombat, TravelCalculator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub game: Arc<GameConfig>,
    pub store: Arc<dyn WorldStore>,
    pub distances: Arc<DistanceCache>,
    pub rally: Arc<RallyPointEngine>,
    pub queues: Arc<QueueManager>,
    pub scheduler: Arc<TickScheduler>,
    pub limiter: ActionRateLimiter,
}

impl AppState {
    pub fn new(
        config: Config,
        game: GameConfig,
        store: Arc<dyn WorldStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let game = Arc::new(game);

        // One distance cache for every travel computation in the process
        let distances = Arc::new(DistanceCache::with_capacity_limit(config.distance_cache_max));

        let rally = Arc::new(RallyPointEngine::new(
            store.clone(),
            TravelCalculator::new(distances.clone()),
            Arc::new(PowerCombat),
            game.clone(),
            clock.clone(),
            config.cancel_policy,
        ));
        let queues = Arc::new(QueueManager::new(store.clone(), game.clone(), clock.clone()));

        let settings = TickSettings {
            concurrency: config.tick_concurrency,
            claim_timeout: Duration::seconds(config.claim_timeout_secs as i64),
        };
        let scheduler = Arc::new(TickScheduler::new(
            store.clone(),
            rally.clone(),
            queues.clone(),
            clock,
            settings,
        ));

        let limiter = ActionRateLimiter::new(config.action_rate_per_sec);

        Self {
            config,
            game,
            store,
            distances,
            rally,
            queues,
            scheduler,
            limiter,
        }
    }
}
