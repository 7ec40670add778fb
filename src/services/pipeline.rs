//! Derivation pipeline: claim a key in the ledger, run the transform outside
//! any transaction, then store and record the result.
//!
//! Binary outputs follow a write-ahead order. The object key is staged on the
//! pending row, the object is written, and only then is the row completed
//! together with the new asset row. A crash between the write and the
//! completion leaves a pending row whose staged object the reconciler adopts.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{AssetService, AssetStore, BeginOutcome, DerivationOutput, DerivationService};
use crate::database::entities::{assets, derivations};
use crate::derivation::{DerivationStatus, FailureKind, OperationParameters};
use crate::errors::{LedgerError, LedgerResult, TransformError};
use crate::poll::{poll_with_backoff, PollError, PollPolicy, PollState};
use crate::transforms::http::fetch;
use crate::transforms::{InputKind, Transform, TransformInput, TransformOutput, TransformRegistry};

/// What to do when another caller already holds a pending row for the key
#[derive(Debug, Clone, PartialEq)]
pub enum PendingPolicy {
    /// Poll the row until it leaves `pending` or the deadline passes
    Wait { deadline: Duration },
    /// Hand the pending row back immediately
    ReturnPending,
    /// Expire the row and start a new attempt once it has been pending this long
    ReattemptIfStale { stale_after: Duration },
}

#[derive(Debug, Clone)]
pub struct DeriveOptions {
    /// Upper bound on the transform call, including downloading its result
    pub timeout: Duration,
    pub pending_policy: PendingPolicy,
    /// Lifetime of signed URLs handed to URL-based transforms
    pub url_ttl: Duration,
    pub wait_poll: PollPolicy,
}

impl Default for DeriveOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            pending_policy: PendingPolicy::Wait {
                deadline: Duration::from_secs(130),
            },
            url_ttl: Duration::from_secs(15 * 60),
            wait_poll: PollPolicy {
                initial_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                ..PollPolicy::default()
            },
        }
    }
}

impl DeriveOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: PendingPolicy) -> Self {
        self.pending_policy = policy;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DeriveOutcome {
    pub derivation: derivations::Model,
    pub output_asset: Option<assets::Model>,
    /// Whether this call invoked the transform
    pub executed: bool,
    /// Time the row has spent pending, when it is still pending
    pub stale_since: Option<Duration>,
}

impl DeriveOutcome {
    pub fn status(&self) -> LedgerResult<DerivationStatus> {
        self.derivation.get_status()
    }
}

enum Produced {
    Binary { bytes: Bytes, content_type: String },
    Text(String),
}

#[derive(Clone)]
pub struct DerivationPipeline {
    store: AssetStore,
    assets: AssetService,
    ledger: DerivationService,
    http: reqwest::Client,
}

impl DerivationPipeline {
    pub fn new(store: AssetStore, assets: AssetService, ledger: DerivationService, http: reqwest::Client) -> Self {
        Self {
            store,
            assets,
            ledger,
            http,
        }
    }

    pub fn ledger(&self) -> &DerivationService {
        &self.ledger
    }

    /// Look up the source asset and the transform for the operation, then derive
    pub async fn derive_by_id(
        &self,
        source_asset_id: Uuid,
        parameters: OperationParameters,
        registry: &TransformRegistry,
        options: &DeriveOptions,
    ) -> LedgerResult<DeriveOutcome> {
        let source = self.assets.get(source_asset_id).await?;
        let transform = registry.get(parameters.operation())?;
        self.derive(&source, parameters, transform.as_ref(), options).await
    }

    #[instrument(skip_all, fields(source = %source.id, operation = %parameters.operation()))]
    pub async fn derive(
        &self,
        source: &assets::Model,
        parameters: OperationParameters,
        transform: &dyn Transform,
        options: &DeriveOptions,
    ) -> LedgerResult<DeriveOutcome> {
        if transform.operation() != parameters.operation() {
            return Err(LedgerError::Validation(format!(
                "Transform for {} cannot run {}",
                transform.operation(),
                parameters.operation()
            )));
        }
        let parameters = parameters.canonicalize()?;

        let BeginOutcome { derivation, created } = self.ledger.begin_derivation(source.id, &parameters).await?;

        match derivation.get_status()? {
            DerivationStatus::Complete => {
                debug!("Derivation {} already complete", derivation.id);
                self.outcome(derivation, false).await
            }
            DerivationStatus::Failed => Err(LedgerError::InvalidState(format!(
                "Ledger returned failed derivation {} as live",
                derivation.id
            ))),
            DerivationStatus::Pending if created => self.run(source, derivation, &parameters, transform, options).await,
            DerivationStatus::Pending => match &options.pending_policy {
                PendingPolicy::ReturnPending => self.outcome(derivation, false).await,
                PendingPolicy::Wait { deadline } => {
                    let settled = self.wait_for(derivation.id, *deadline, &options.wait_poll).await?;
                    self.outcome(settled, false).await
                }
                PendingPolicy::ReattemptIfStale { stale_after } => {
                    let pending_for = derivation.stale_since(Utc::now()).unwrap_or_default();
                    if pending_for < *stale_after {
                        return self.outcome(derivation, false).await;
                    }
                    self.reattempt(source, derivation, pending_for, &parameters, transform, options)
                        .await
                }
            },
        }
    }

    async fn reattempt(
        &self,
        source: &assets::Model,
        stale: derivations::Model,
        pending_for: Duration,
        parameters: &OperationParameters,
        transform: &dyn Transform,
        options: &DeriveOptions,
    ) -> LedgerResult<DeriveOutcome> {
        let reason = format!("Superseded after pending for {}s", pending_for.as_secs());
        match self.ledger.fail_derivation(stale.id, FailureKind::Expired, &reason).await {
            // A concurrent completion is fine, begin below returns it
            Ok(_) | Err(LedgerError::InvalidState(_)) => {}
            Err(err) => return Err(err),
        }

        let BeginOutcome { derivation, created } = self.ledger.begin_derivation(source.id, parameters).await?;
        if created {
            info!("Reattempting stale derivation {} as {}", stale.id, derivation.id);
            self.run(source, derivation, parameters, transform, options).await
        } else {
            self.outcome(derivation, false).await
        }
    }

    async fn wait_for(&self, id: Uuid, deadline: Duration, poll: &PollPolicy) -> LedgerResult<derivations::Model> {
        let policy = poll.clone().with_deadline(deadline);
        let ledger = &self.ledger;

        let waited = poll_with_backoff(&policy, |_| async move {
            let row = ledger.get(id).await?;
            if row.is_pending() {
                Ok(PollState::Pending)
            } else {
                Ok(PollState::Ready(row))
            }
        })
        .await;

        match waited {
            Ok(row) => Ok(row),
            Err(PollError::Failed(err)) => Err(err),
            Err(exhausted @ PollError::Exhausted { .. }) => {
                debug!("Derivation {} {}", id, exhausted);
                self.ledger.get(id).await
            }
        }
    }

    async fn run(
        &self,
        source: &assets::Model,
        derivation: derivations::Model,
        parameters: &OperationParameters,
        transform: &dyn Transform,
        options: &DeriveOptions,
    ) -> LedgerResult<DeriveOutcome> {
        let id = derivation.id;
        let produced = match timeout(options.timeout, self.execute(source, parameters, transform, options.url_ttl)).await
        {
            Err(_) => return self.record_failure(id, LedgerError::Timeout(options.timeout)).await,
            Ok(Err(err)) => return self.record_failure(id, err).await,
            Ok(Ok(produced)) => produced,
        };

        match produced {
            Produced::Text(text) => match self.ledger.complete_derivation(id, DerivationOutput::Text(text)).await {
                Ok(completed) => Ok(self.executed(completed, None)),
                Err(LedgerError::InvalidState(reason)) => self.superseded(&derivation, &reason).await,
                Err(err) => Err(err),
            },
            Produced::Binary { bytes, content_type } => {
                let key = AssetStore::generate_key(source.owner_id, &content_type);
                match self.ledger.stage_output(id, &key, &content_type).await {
                    Ok(()) => {}
                    Err(LedgerError::InvalidState(reason)) => return self.superseded(&derivation, &reason).await,
                    Err(err) => return Err(err),
                }

                let asset = match self.store.put_at(source.owner_id, &key, bytes, &content_type).await {
                    Ok(asset) => asset,
                    Err(err) => return self.record_failure(id, err.into()).await,
                };

                match self
                    .ledger
                    .complete_derivation(id, DerivationOutput::NewAsset(asset.clone()))
                    .await
                {
                    Ok(completed) => Ok(self.executed(completed, Some(asset))),
                    Err(LedgerError::InvalidState(reason)) => {
                        warn!("Derivation {} left object {} unreferenced", id, key);
                        self.superseded(&derivation, &reason).await
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// The row was expired or reattempted while this call was still running.
    /// Report whatever now holds the key instead of the stale attempt.
    async fn superseded(&self, derivation: &derivations::Model, reason: &str) -> LedgerResult<DeriveOutcome> {
        info!("Derivation {} was superseded before completing: {}", derivation.id, reason);
        let current = match self.ledger.find_live(&derivation.idempotency_key).await? {
            Some(live) => live,
            None => self.ledger.get(derivation.id).await?,
        };
        self.outcome(current, true).await
    }

    async fn execute(
        &self,
        source: &assets::Model,
        parameters: &OperationParameters,
        transform: &dyn Transform,
        url_ttl: Duration,
    ) -> LedgerResult<Produced> {
        let mut input = TransformInput {
            asset_id: source.id,
            owner_id: source.owner_id,
            content_type: source.content_type.clone(),
            bytes: None,
            url: None,
        };
        match transform.input_kind(parameters) {
            InputKind::Bytes => input.bytes = Some(self.store.get(source).await?),
            InputKind::Url => input.url = Some(self.store.signed_read_url(source, url_ttl).await?),
        }

        let operation = parameters.operation();
        let output = transform.apply(input, parameters).await?;

        let produced = match output {
            TransformOutput::Text(text) if operation.produces_text() => Produced::Text(text),
            TransformOutput::Binary { bytes, content_type } if !operation.produces_text() => {
                Produced::Binary { bytes, content_type }
            }
            TransformOutput::RemoteUrl { url, content_type } if !operation.produces_text() => {
                let fetched = fetch(&self.http, &url).await?;
                let content_type = content_type
                    .or(fetched.content_type)
                    .filter(|ct| ct != "application/octet-stream")
                    .or_else(|| {
                        image::guess_format(&fetched.bytes)
                            .ok()
                            .map(|format| format.to_mime_type().to_string())
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                Produced::Binary {
                    bytes: fetched.bytes,
                    content_type,
                }
            }
            _ => {
                return Err(TransformError::malformed(
                    operation.as_str(),
                    "transform returned the wrong kind of output",
                )
                .into())
            }
        };

        if let Produced::Binary { bytes, .. } = &produced {
            if bytes.is_empty() {
                return Err(TransformError::malformed(operation.as_str(), "transform returned no bytes").into());
            }
        }
        Ok(produced)
    }

    /// Record a storage, transform or timeout error on the row; anything else
    /// propagates and leaves the row for reconciliation
    async fn record_failure(&self, id: Uuid, err: LedgerError) -> LedgerResult<DeriveOutcome> {
        let Some(kind) = err.failure_kind() else {
            warn!("Derivation {} interrupted: {}", id, err);
            return Err(err);
        };
        let failed = self.ledger.fail_derivation(id, kind, &err.to_string()).await?;
        Ok(self.executed(failed, None))
    }

    fn executed(&self, derivation: derivations::Model, output_asset: Option<assets::Model>) -> DeriveOutcome {
        DeriveOutcome {
            stale_since: derivation.stale_since(Utc::now()),
            derivation,
            output_asset,
            executed: true,
        }
    }

    async fn outcome(&self, derivation: derivations::Model, executed: bool) -> LedgerResult<DeriveOutcome> {
        let output_asset = match derivation.output_asset_id {
            Some(asset_id) => self.assets.find(asset_id).await?,
            None => None,
        };
        Ok(DeriveOutcome {
            stale_since: derivation.stale_since(Utc::now()),
            derivation,
            output_asset,
            executed,
        })
    }
}
