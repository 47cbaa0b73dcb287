//! Pipeline assembly and lifecycle.
//!
//! [`SyncPipeline`] owns every component and the background tasks that drive
//! them. Construct it once, call [`SyncPipeline::start`], and call
//! [`SyncPipeline::shutdown`] before exit.

use alloy_primitives::U256;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::applier::{ApplyError, EventApplier};
use crate::chain::{
    ChainError, ChainProvider, ConnectionManager, ConnectionState, ContractMetadata,
};
use crate::checkpoint::{cold_start_floor, CheckpointStore, CheckpointTracker};
use crate::config::SyncConfig;
use crate::email::EmailSender;
use crate::executor::{endpoints, EndpointSnapshot, RequestExecutor};
use crate::store::{Vault, VaultStore};
use crate::sync::{
    HistoricalSyncEngine, LiveExit, LiveSubscriber, PeriodicScheduler, SkippedGap, SyncOutcome,
};

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub enabled: bool,
    pub connection: ConnectionState,
    pub consecutive_failures: u32,
    pub reconnect_halted: bool,
    pub last_processed_block: u64,
    pub skipped_gaps: Vec<SkippedGap>,
    pub contract: Option<ContractMetadata>,
    pub endpoints: Vec<EndpointSnapshot>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    provider: Arc<dyn ChainProvider>,
    executor: Arc<RequestExecutor>,
    connection: Arc<ConnectionManager>,
    checkpoint: Arc<CheckpointTracker>,
    applier: Arc<EventApplier>,
    engine: Arc<HistoricalSyncEngine>,
    live: Arc<LiveSubscriber>,
    scheduler: Arc<PeriodicScheduler>,
    contract_metadata: RwLock<Option<ContractMetadata>>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    live_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn VaultStore>,
        email: Arc<dyn EmailSender>,
    ) -> Result<Self, ChainError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let executor = Arc::new(RequestExecutor::new(config.executor.clone()));
        let contract = config.contract_address;

        let checkpoint = Arc::new(match &config.checkpoint_path {
            Some(path) => CheckpointTracker::with_store(CheckpointStore::new(path)),
            None => CheckpointTracker::new(0),
        });

        let connection = Arc::new(ConnectionManager::new(
            config.connection(),
            provider.clone(),
            executor.clone(),
            cancel.clone(),
        ));

        let applier = Arc::new(EventApplier::new(
            store,
            email,
            provider.clone(),
            executor.clone(),
            contract,
            config.native_symbol.clone(),
        ));

        let engine = Arc::new(HistoricalSyncEngine::new(
            config.historical(),
            contract,
            provider.clone(),
            executor.clone(),
            applier.clone(),
            checkpoint.clone(),
            cancel.child_token(),
        ));

        let live = Arc::new(LiveSubscriber::new(
            contract,
            provider.clone(),
            executor.clone(),
            applier.clone(),
            config.poll_interval(),
        ));

        let scheduler = Arc::new(PeriodicScheduler::new(
            config.sync_interval(),
            engine.clone(),
            connection.clone(),
            provider.clone(),
            executor.clone(),
        ));

        Ok(Self {
            config,
            provider,
            executor,
            connection,
            checkpoint,
            applier,
            engine,
            live,
            scheduler,
            contract_metadata: RwLock::new(None),
            scheduler_task: Mutex::new(None),
            live_task: Mutex::new(None),
            cancel,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointTracker> {
        &self.checkpoint
    }

    pub fn applier(&self) -> &Arc<EventApplier> {
        &self.applier
    }

    pub fn engine(&self) -> &Arc<HistoricalSyncEngine> {
        &self.engine
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    /// Connect, verify the contract and seed the checkpoint on a cold start.
    /// Returns the chain height observed while connecting.
    pub async fn initialize(&self) -> Result<u64, ChainError> {
        let head = self.connection.connect_with_retry().await?;

        if self.checkpoint.current() == 0 {
            let floor = cold_start_floor(
                self.config.deployment_block,
                head,
                self.config.cold_start_lookback,
            );
            self.checkpoint.seed_floor(floor);
        }

        self.load_contract_metadata().await;
        Ok(head)
    }

    async fn load_contract_metadata(&self) {
        if self.contract_metadata.read().is_some() {
            return;
        }

        let provider = self.provider.as_ref();
        let contract = self.config.contract_address;
        match self
            .executor
            .execute(endpoints::CONTRACT_CALL, || async move {
                provider.contract_metadata(contract).await
            })
            .await
        {
            Ok(metadata) => {
                tracing::info!(
                    platform_fee_bps = %metadata.platform_fee_bps,
                    fee_recipient = %metadata.fee_recipient,
                    "Contract metadata"
                );
                *self.contract_metadata.write() = Some(metadata);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to read contract metadata"),
        }
    }

    /// Initialize and run a single catch-up sync.
    pub async fn run_once(&self) -> Result<SyncOutcome, ChainError> {
        let head = self.initialize().await?;
        self.engine.catch_up(head).await
    }

    /// Initialize, catch up, then start the scheduler and (when enabled) the
    /// live subscriber in the background.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChainError> {
        if !self.config.enabled {
            tracing::info!("Vault sync disabled by configuration");
            return Ok(());
        }

        tracing::info!(
            contract = %self.config.contract_address,
            live = self.config.live_enabled,
            "Starting vault sync pipeline"
        );

        let head = self.initialize().await?;
        if let Err(e) = self.engine.catch_up(head).await {
            tracing::warn!(error = %e, "Startup catch-up failed, scheduler will retry");
        }

        {
            let scheduler = self.scheduler.clone();
            let cancel = self.cancel.child_token();
            *self.scheduler_task.lock() =
                Some(tokio::spawn(async move { scheduler.run(cancel).await }));
        }

        if self.config.live_enabled {
            self.spawn_live();
        }

        Ok(())
    }

    fn spawn_live(self: &Arc<Self>) {
        let mut slot = self.live_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let pipeline = self.clone();
        *slot = Some(tokio::spawn(async move { pipeline.supervise_live().await }));
    }

    /// Run the live subscriber, reconnecting and repairing the gap after each
    /// disconnect until cancelled or reconnection is halted.
    async fn supervise_live(&self) {
        loop {
            let (error, delivered) = match self.live.run(self.cancel.child_token()).await {
                LiveExit::Cancelled => return,
                LiveExit::Disconnected { error, delivered } => (error, delivered),
            };

            let delay = match self.connection.session_lost(&error, delivered) {
                Ok(delay) => delay,
                Err(e) => {
                    tracing::error!(error = %e, "Live delivery stopped until reinitialized");
                    return;
                }
            };
            tracing::warn!(
                error = %error,
                delivered,
                delay_ms = delay.as_millis() as u64,
                "Live session lost, reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connection.reconnect().await {
                Ok(head) => {
                    if let Err(e) = self.engine.catch_up(head).await {
                        tracing::warn!(error = %e, "Post-reconnect gap repair failed");
                    }
                }
                Err(e) => {
                    if !self.cancel.is_cancelled() {
                        tracing::error!(error = %e, "Live delivery stopped until reinitialized");
                    }
                    return;
                }
            }
        }
    }

    /// Operator reset after reconnection halted: clears the attempt counter,
    /// reconnects, repairs the gap and restarts live delivery.
    pub async fn reinitialize(self: &Arc<Self>) -> Result<(), ChainError> {
        let head = self.connection.reinitialize().await?;
        self.load_contract_metadata().await;
        if let Err(e) = self.engine.catch_up(head).await {
            tracing::warn!(error = %e, "Gap repair after reinitialize failed");
        }
        if self.config.enabled && self.config.live_enabled {
            self.spawn_live();
        }
        Ok(())
    }

    pub async fn resync_vault(&self, vault_id: U256) -> Result<Vault, ApplyError> {
        self.applier.resync_vault(vault_id).await
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            enabled: self.config.enabled,
            connection: self.connection.state(),
            consecutive_failures: self.connection.consecutive_failures(),
            reconnect_halted: self.connection.is_halted(),
            last_processed_block: self.checkpoint.current(),
            skipped_gaps: self.engine.skipped_gaps(),
            contract: self.contract_metadata.read().clone(),
            endpoints: self.executor.snapshot(),
        }
    }

    /// Stop accepting live events, let in-flight application finish, cancel
    /// the timer and release the connection.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down vault sync pipeline");
        self.cancel.cancel();

        let tasks = [self.live_task.lock().take(), self.scheduler_task.lock().take()];
        for task in tasks.into_iter().flatten() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Pipeline task ended abnormally");
            }
        }

        self.connection.shutdown();
        tracing::info!(
            last_processed_block = self.checkpoint.current(),
            "Vault sync pipeline stopped"
        );
    }
}
