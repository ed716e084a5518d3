//! PipelineBuilder - ports のワイヤリング
//!
//! # Fail-fast 設計
//! - store / broker / executor が揃っていなければ build() で BuildError
//! - ループの設定値も build() 時に検証する（起動後に気づくより早く落ちる）
//!
//! # 使用例
//! ```ignore
//! let pipeline = PipelineBuilder::new()
//!     .store(Arc::new(InMemoryStore::new()))
//!     .broker_producer(Arc::new(broker.clone()))
//!     .broker_consumer(Arc::new(broker.consumer("notifications")))
//!     .executor(Arc::new(NotificationExecutor::new(settings, LogTransport)))
//!     .config(&config)
//!     .build()?;
//! let supervisor = Supervisor::spawn(&pipeline);
//! ```

use std::sync::Arc;

use crate::app::consumer_loop::ConsumerLoop;
use crate::app::producer_loop::ProducerLoop;
use crate::app::reaper_loop::ReaperLoop;
use crate::config::{self, ConfigError, ConsumerConfig, HeraldConfig, ProducerConfig, ReaperConfig};
use crate::ports::{
    BrokerConsumer, BrokerProducer, Clock, DispatchLedger, OutboxStore, SideEffectExecutor,
    SystemClock,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing components: {0:?}. These must be provided before build().")]
    MissingComponents(Vec<&'static str>),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

pub struct PipelineBuilder {
    outbox: Option<Arc<dyn OutboxStore>>,
    ledger: Option<Arc<dyn DispatchLedger>>,
    producer: Option<Arc<dyn BrokerProducer>>,
    consumer: Option<Arc<dyn BrokerConsumer>>,
    executor: Option<Arc<dyn SideEffectExecutor>>,
    clock: Arc<dyn Clock>,
    producer_config: ProducerConfig,
    consumer_config: ConsumerConfig,
    reaper_config: ReaperConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            outbox: None,
            ledger: None,
            producer: None,
            consumer: None,
            executor: None,
            clock: Arc::new(SystemClock),
            producer_config: ProducerConfig::default(),
            consumer_config: ConsumerConfig::default(),
            reaper_config: ReaperConfig::default(),
        }
    }

    /// outbox テーブルと dispatch ledger は同じ DB に置く必要があるので、
    /// 1 つの値で両方を渡す
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: OutboxStore + DispatchLedger + 'static,
    {
        self.outbox = Some(store.clone());
        self.ledger = Some(store);
        self
    }

    pub fn broker_producer(mut self, producer: Arc<dyn BrokerProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn broker_consumer(mut self, consumer: Arc<dyn BrokerConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn SideEffectExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: &HeraldConfig) -> Self {
        self.producer_config = config.producer.clone();
        self.consumer_config = config.consumer.clone();
        self.reaper_config = config.reaper.clone();
        self
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        let mut missing = Vec::new();
        if self.outbox.is_none() {
            missing.push("store");
        }
        if self.producer.is_none() {
            missing.push("broker_producer");
        }
        if self.consumer.is_none() {
            missing.push("broker_consumer");
        }
        if self.executor.is_none() {
            missing.push("executor");
        }

        let (Some(outbox), Some(ledger), Some(producer), Some(consumer), Some(executor)) = (
            self.outbox,
            self.ledger,
            self.producer,
            self.consumer,
            self.executor,
        ) else {
            return Err(BuildError::MissingComponents(missing));
        };

        let mut problems = Vec::new();
        self.producer_config.check(&mut problems);
        self.consumer_config.check(&mut problems);
        self.reaper_config.check(&mut problems);
        config::into_result(problems)?;

        Ok(Pipeline {
            outbox,
            ledger,
            producer,
            consumer,
            executor,
            clock: self.clock,
            producer_config: self.producer_config,
            consumer_config: self.consumer_config,
            reaper_config: self.reaper_config,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// ワイヤリング済みのコンポーネント。ループを組み立てて渡し、実行は `Supervisor` が行う
pub struct Pipeline {
    outbox: Arc<dyn OutboxStore>,
    ledger: Arc<dyn DispatchLedger>,
    producer: Arc<dyn BrokerProducer>,
    consumer: Arc<dyn BrokerConsumer>,
    executor: Arc<dyn SideEffectExecutor>,
    clock: Arc<dyn Clock>,
    producer_config: ProducerConfig,
    consumer_config: ConsumerConfig,
    reaper_config: ReaperConfig,
}

impl Pipeline {
    pub fn outbox(&self) -> &Arc<dyn OutboxStore> {
        &self.outbox
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn producer_instances(&self) -> usize {
        self.producer_config.instances
    }

    pub fn producer_loop(&self, instance: usize) -> ProducerLoop {
        ProducerLoop::new(
            self.outbox.clone(),
            self.producer.clone(),
            self.clock.clone(),
            self.producer_config.clone(),
        )
        .with_instance(instance)
    }

    pub fn consumer_loop(&self) -> ConsumerLoop {
        ConsumerLoop::new(
            self.consumer.clone(),
            self.ledger.clone(),
            self.executor.clone(),
            self.clock.clone(),
            self.consumer_config.clone(),
        )
    }

    pub fn reaper_loop(&self) -> ReaperLoop {
        ReaperLoop::new(
            self.outbox.clone(),
            self.clock.clone(),
            self.reaper_config.clone(),
        )
    }
}
