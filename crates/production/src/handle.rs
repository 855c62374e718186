//! Client-side handle to a running engine.

use crate::RunnerError;
use pumplink_core::PumpStatus;
use pumplink_types::{DoseError, DoseKind, DoseRecord};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Requests from clients, turned into node events by the runner.
#[derive(Debug)]
pub(crate) enum ClientRequest {
    Dose {
        kind: DoseKind,
        reply: oneshot::Sender<Result<DoseRecord, DoseError>>,
    },
    ForceRead,
    GlucoseObserved {
        timestamp: Duration,
    },
}

/// Cloneable handle for the dosing collaborator and anything else that
/// talks to the engine from outside its event loop.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    client_tx: mpsc::Sender<ClientRequest>,
    status_rx: watch::Receiver<Option<PumpStatus>>,
}

impl EngineHandle {
    pub(crate) fn new(
        client_tx: mpsc::Sender<ClientRequest>,
        status_rx: watch::Receiver<Option<PumpStatus>>,
    ) -> Self {
        Self {
            client_tx,
            status_rx,
        }
    }

    /// Submit a dose recommendation and wait for its single outcome.
    pub async fn request_dose(&self, kind: DoseKind) -> Result<DoseRecord, RunnerError> {
        let (reply, rx) = oneshot::channel();
        self.client_tx
            .send(ClientRequest::Dose { kind, reply })
            .await
            .map_err(|_| RunnerError::ChannelClosed)?;
        let result = rx.await.map_err(|_| RunnerError::RequestDropped)?;
        Ok(result?)
    }

    /// Mark pump data stale and poll now.
    pub async fn force_read(&self) -> Result<(), RunnerError> {
        self.send(ClientRequest::ForceRead).await
    }

    /// Report glucose seen outside the pump link (for example from a CGM app).
    pub async fn glucose_observed(&self, timestamp: Duration) -> Result<(), RunnerError> {
        self.send(ClientRequest::GlucoseObserved { timestamp }).await
    }

    /// Latest published pump status, if any poll has finished yet.
    pub fn status(&self) -> Option<PumpStatus> {
        self.status_rx.borrow().clone()
    }

    /// Receiver that wakes on every published status.
    pub fn subscribe_status(&self) -> watch::Receiver<Option<PumpStatus>> {
        self.status_rx.clone()
    }

    async fn send(&self, request: ClientRequest) -> Result<(), RunnerError> {
        self.client_tx
            .send(request)
            .await
            .map_err(|_| RunnerError::ChannelClosed)
    }
}
