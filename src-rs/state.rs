use std::sync::Arc;

use crate::{config::Config, pipeline::Pipeline, queue::JobQueue, store::Store};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(config: Config, store: Store, pipeline: Pipeline) -> Self {
        Self {
            config: Arc::new(config),
            store,
            pipeline,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        self.pipeline.queue()
    }
}
