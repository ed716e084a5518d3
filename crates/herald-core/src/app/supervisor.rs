use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

use crate::app::builder::Pipeline;
use crate::domain::HeraldError;

/// 監視対象ループの終わり方
#[derive(Debug)]
pub enum TaskOutcome {
    Completed,
    Failed(HeraldError),
    Panicked(String),
}

#[derive(Debug)]
pub struct TaskExit {
    pub name: String,
    pub outcome: TaskOutcome,
}

impl TaskExit {
    pub fn is_clean(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Completed)
    }
}

type TaskResult = Result<Result<(), HeraldError>, JoinError>;

/// producer インスタンス群・consumer・reaper を動かす
/// - `request_shutdown()` でループ全体が止まる（処理中の 1 件は最後まで終える）
/// - どれか 1 つがエラーか panic で終わると残りも止める。再起動は外側（プロセス監視）の仕事
pub struct Supervisor {
    shutdown_tx: Arc<watch::Sender<bool>>,
    joins: Vec<(String, JoinHandle<TaskResult>)>,
}

impl Supervisor {
    fn empty() -> (Self, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Self {
            shutdown_tx: Arc::new(shutdown_tx),
            joins: Vec::new(),
        };
        (supervisor, shutdown_rx)
    }

    pub fn spawn(pipeline: &Pipeline) -> Self {
        let (mut supervisor, shutdown_rx) = Self::empty();

        for instance in 0..pipeline.producer_instances() {
            let producer = pipeline.producer_loop(instance);
            let rx = shutdown_rx.clone();
            supervisor.track(format!("producer-{instance}"), async move {
                producer.run(rx).await
            });
        }

        let consumer = pipeline.consumer_loop();
        let rx = shutdown_rx.clone();
        supervisor.track("consumer".to_string(), async move { consumer.run(rx).await });

        let reaper = pipeline.reaper_loop();
        supervisor.track("reaper".to_string(), async move { reaper.run(shutdown_rx).await });

        info!(tasks = supervisor.joins.len(), "Pipeline started");
        supervisor
    }

    /// ループ本体は別 task で動かし、その JoinHandle を見張る。
    /// Err でも panic でも shutdown を送る。
    fn track<F>(&mut self, name: String, task: F)
    where
        F: Future<Output = Result<(), HeraldError>> + Send + 'static,
    {
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        let task_name = name.clone();
        let join = tokio::spawn(async move {
            let result = tokio::spawn(task).await;
            let stop = match &result {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    error!(task = %task_name, error = %e, "Supervised task failed, stopping pipeline");
                    true
                }
                Err(e) => {
                    error!(task = %task_name, error = %e, "Supervised task panicked, stopping pipeline");
                    true
                }
            };
            if stop {
                // ignore send error: every receiver may already be gone
                let _ = shutdown_tx.send(true);
            }
            result
        });
        self.joins.push((name, join));
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// 呼び出し側か、失敗した task が shutdown を要求したら完了する
    pub async fn stopped(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// shutdown して全 task を待つ
    pub async fn shutdown_and_join(self) -> Vec<TaskExit> {
        self.request_shutdown();
        let mut exits = Vec::with_capacity(self.joins.len());
        for (name, join) in self.joins {
            let outcome = match join.await {
                Ok(Ok(Ok(()))) => TaskOutcome::Completed,
                Ok(Ok(Err(e))) => TaskOutcome::Failed(e),
                Ok(Err(e)) | Err(e) => TaskOutcome::Panicked(e.to_string()),
            };
            exits.push(TaskExit { name, outcome });
        }
        info!("Pipeline stopped");
        exits
    }
}
