pub mod factory;
pub mod playbook;
pub mod process;
pub mod queue;
pub mod runner;
pub mod worker;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{PlaybookCatalog, ToolCatalog};
use crate::entities::{SqliteStore, TargetSource};
use crate::parser::{NmapXmlParser, ServiceParser};

use factory::TaskFactory;
use playbook::PlaybookEngine;
use queue::JobQueue;
use runner::TaskRunner;
use worker::Worker;

/// The runtime components wired to one store and one output directory.
///
/// Cloning is cheap; every component shares the same store handle.
#[derive(Clone)]
pub struct Runtime {
    pub store: Arc<SqliteStore>,
    pub tools: Arc<ToolCatalog>,
    pub playbooks: Arc<PlaybookCatalog>,
    pub queue: JobQueue,
    pub factory: TaskFactory,
    pub runner: TaskRunner,
    pub engine: PlaybookEngine,
    /// Reads structured reports back into services.
    pub parser: Arc<dyn ServiceParser>,
}

impl Runtime {
    pub fn new(
        store: Arc<SqliteStore>,
        tools: Arc<ToolCatalog>,
        playbooks: Arc<PlaybookCatalog>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let output_dir = output_dir.into();
        let queue = JobQueue::new(store.clone());
        let factory = TaskFactory::new(store.clone(), tools.clone(), queue.clone(), &output_dir);
        let runner = TaskRunner::new(store.clone(), tools.clone(), &output_dir);
        let targets: Arc<dyn TargetSource> = store.clone();
        let parser: Arc<dyn ServiceParser> = Arc::new(NmapXmlParser);
        let engine = PlaybookEngine::new(
            playbooks.clone(),
            targets,
            factory.clone(),
            runner.clone(),
            parser.clone(),
        );
        Self {
            store,
            tools,
            playbooks,
            queue,
            factory,
            runner,
            engine,
            parser,
        }
    }

    /// Replace the playbook engine's target source and the result parser.
    pub fn with_collaborators(
        mut self,
        targets: Arc<dyn TargetSource>,
        parser: Arc<dyn ServiceParser>,
    ) -> Self {
        self.engine = PlaybookEngine::new(
            self.playbooks.clone(),
            targets,
            self.factory.clone(),
            self.runner.clone(),
            parser.clone(),
        );
        self.parser = parser;
        self
    }

    pub fn worker(&self, poll_interval: Duration) -> Worker {
        Worker::new(
            self.store.clone(),
            self.queue.clone(),
            self.runner.clone(),
            self.engine.clone(),
            poll_interval,
        )
    }
}
