//! Bidirectional message proxy with payment interception points.
//!
//! One task per direction. Local→remote watches for approval replays and
//! turns them into staged payment headers; remote→local runs challenge
//! enrichment. Everything that is not payment traffic passes through
//! byte-for-byte untouched. Per-direction ordering is preserved;
//! cross-direction ordering is unspecified. The proxy imposes no
//! timeouts of its own.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use px402::message::Request;
use px402::orchestrator::{PaymentOrchestrator, has_approval_markers};
use px402::protocol::HeaderSet;
use px402::signer::Signer;
use tokio::task::JoinHandle;

use crate::inject::{AuthHeaderInjector, IdentityConfig};
use crate::transport::Transport;

/// A running proxy; join it to wait for both directions to finish.
#[derive(Debug)]
pub struct ProxyHandle {
    local_to_remote: JoinHandle<()>,
    remote_to_local: JoinHandle<()>,
}

impl ProxyHandle {
    /// Waits for both direction tasks to finish.
    pub async fn join(self) {
        let _ = self.local_to_remote.await;
        let _ = self.remote_to_local.await;
    }

    /// Aborts both direction tasks.
    pub fn abort(&self) {
        self.local_to_remote.abort();
        self.remote_to_local.abort();
    }
}

/// Wires two transports together, optionally payment-aware.
///
/// With a signer, an orchestrator sits on both interception points; with
/// `None`, the proxy is a pure pass-through. Either side closing closes
/// the other exactly once.
pub fn wire(
    local: Arc<dyn Transport>,
    remote: Arc<dyn Transport>,
    signer: Option<Arc<dyn Signer>>,
) -> ProxyHandle {
    let orchestrator = signer.map(|s| Arc::new(PaymentOrchestrator::new(s)));
    // Payment headers are staged, so the remote must carry a staging
    // slot whenever payments can happen; a bare transport would drop
    // them. The plain wrapper adds nothing beyond the slot.
    let remote: Arc<dyn Transport> = if orchestrator.is_some() {
        Arc::new(AuthHeaderInjector::new(remote, IdentityConfig::default()))
    } else {
        remote
    };
    let last_request: Arc<Mutex<Option<Request>>> = Arc::new(Mutex::new(None));

    // One guard per direction so each close handler fires at most once.
    let outbound_done = Arc::new(AtomicBool::new(false));
    let inbound_done = Arc::new(AtomicBool::new(false));

    let local_to_remote = tokio::spawn(run_outbound(
        Arc::clone(&local),
        Arc::clone(&remote),
        orchestrator.clone(),
        Arc::clone(&last_request),
        Arc::clone(&outbound_done),
    ));
    let remote_to_local = tokio::spawn(run_inbound(
        local,
        remote,
        orchestrator,
        last_request,
        inbound_done,
    ));

    ProxyHandle {
        local_to_remote,
        remote_to_local,
    }
}

/// Local→remote pump: record requests, intercept approvals, forward.
async fn run_outbound(
    local: Arc<dyn Transport>,
    remote: Arc<dyn Transport>,
    orchestrator: Option<Arc<PaymentOrchestrator>>,
    last_request: Arc<Mutex<Option<Request>>>,
    done: Arc<AtomicBool>,
) {
    while let Some(message) = local.recv().await {
        if let Some(request) = message.as_request() {
            *last_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(request.clone());

            if let Some(orchestrator) = &orchestrator
                && has_approval_markers(request)
            {
                match orchestrator.authorize(request).await {
                    Ok(headers) => {
                        tracing::info!(
                            headers = ?headers.names().collect::<Vec<_>>(),
                            "payment authorized; staging headers for replay"
                        );
                        remote.stage_headers(headers);
                        // The approved request itself is forwarded below.
                    }
                    Err(error) => {
                        // Authorization failed: answer the local side,
                        // never forward the broken approval.
                        if local.send(*error, HeaderSet::new()).await.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
        }
        if remote.send(message, HeaderSet::new()).await.is_err() {
            tracing::warn!("remote send failed; closing");
            break;
        }
    }
    if !done.swap(true, Ordering::SeqCst) {
        remote.close().await;
        local.close().await;
    }
}

/// Remote→local pump: enrich challenges, forward everything else as-is.
async fn run_inbound(
    local: Arc<dyn Transport>,
    remote: Arc<dyn Transport>,
    orchestrator: Option<Arc<PaymentOrchestrator>>,
    last_request: Arc<Mutex<Option<Request>>>,
    done: Arc<AtomicBool>,
) {
    while let Some(message) = remote.recv().await {
        let outbound = match &orchestrator {
            Some(orchestrator) => {
                let request = last_request
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                orchestrator
                    .enrich_challenge(&message, request.as_ref())
                    .await
            }
            None => message,
        };
        if local.send(outbound, HeaderSet::new()).await.is_err() {
            tracing::warn!("local send failed; closing");
            break;
        }
    }
    if !done.swap(true, Ordering::SeqCst) {
        local.close().await;
        remote.close().await;
    }
}
