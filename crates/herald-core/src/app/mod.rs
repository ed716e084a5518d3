//! App - アプリケーション層
//!
//! ports を組み合わせて outbox relay のループを実装します。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder**: ports のワイヤリングと起動時検証
//! - **ProducerLoop**: outbox → broker（claim → publish → mark）
//! - **ConsumerLoop**: broker → executor（reserve → execute → finalize → commit）
//! - **ReaperLoop**: 放置された claim の回収
//! - **Supervisor**: ループ群の起動・停止
//! - **status**: 状態別件数

pub mod builder;
pub mod consumer_loop;
pub mod producer_loop;
pub mod reaper_loop;
pub mod status;
pub mod supervisor;

pub use self::builder::{BuildError, Pipeline, PipelineBuilder};
pub use self::consumer_loop::{ConsumerLoop, DispatchOutcome};
pub use self::producer_loop::{ProduceReport, ProducerLoop};
pub use self::reaper_loop::ReaperLoop;
pub use self::status::OutboxCounts;
pub use self::supervisor::{Supervisor, TaskExit, TaskOutcome};
