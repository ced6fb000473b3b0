use crate::common::PixelRect;
use crate::remote::client::{RemoteRequest, RemoteResult};
use crate::remote::service::RemoteLandmarkService;
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tower::ServiceExt;

/// A finished refinement together with the window it was computed on.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRefinement {
    pub result: RemoteResult,
    pub roi: PixelRect,
    pub frame_width: u32,
    pub frame_height: u32,
}

struct Pending {
    rx: oneshot::Receiver<Option<RemoteResult>>,
    roi: PixelRect,
    frame_width: u32,
    frame_height: u32,
}

/// Single-slot bridge from the synchronous processing loop to the async remote
/// service. At most one call is in flight; results are collected by polling.
pub struct RemoteSlot {
    service: RemoteLandmarkService,
    runtime: Handle,
    pending: Option<Pending>,
}

impl RemoteSlot {
    pub fn new(service: RemoteLandmarkService, runtime: Handle) -> Self {
        Self {
            service,
            runtime,
            pending: None,
        }
    }

    pub fn service(&self) -> &RemoteLandmarkService {
        &self.service
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Start a refinement unless one is already in flight.
    pub fn submit(
        &mut self,
        request: RemoteRequest,
        roi: PixelRect,
        frame_width: u32,
        frame_height: u32,
    ) -> bool {
        if self.pending.is_some() {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        let service = self.service.clone();
        self.runtime.spawn(async move {
            let result = match service.oneshot(request).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::debug!("Remote refinement failed: {}", err);
                    None
                }
            };
            let _ = tx.send(result);
        });
        self.pending = Some(Pending {
            rx,
            roi,
            frame_width,
            frame_height,
        });
        true
    }

    /// Collect a finished call. Refused or failed calls free the slot and yield nothing.
    pub fn poll(&mut self) -> Option<CompletedRefinement> {
        let pending = self.pending.as_mut()?;
        match pending.rx.try_recv() {
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => {
                self.pending = None;
                None
            }
            Ok(result) => {
                let pending = self.pending.take()?;
                result.map(|result| CompletedRefinement {
                    result,
                    roi: pending.roi,
                    frame_width: pending.frame_width,
                    frame_height: pending.frame_height,
                })
            }
        }
    }
}
