//! Scripted in-memory adapter for exercising orchestration logic without a
//! cloud account or vendor CLI. Enabled via the `test-helpers` feature.
//!
//! Outcomes are queued per operation; when a queue runs dry the adapter
//! falls back to a benign default (create succeeds with a fresh handle,
//! describe reports `Available`). Call counts are recorded so tests can
//! assert how many attempts or polls an engine made.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vdi_core::CloudProvider;

use crate::{
    AdapterFactory, Bundle, CloudAdapter, ConnectionDetails, CreatedDesktop, CredentialMaterial,
    DesktopSnapshot, DesktopSpec, DesktopState, ProviderError,
};

type Scripted<T> = Mutex<VecDeque<Result<T, ProviderError>>>;

pub struct StubAdapter {
    provider: CloudProvider,
    create_queue: Scripted<CreatedDesktop>,
    describe_queue: Scripted<DesktopSnapshot>,
    lifecycle_queue: Scripted<()>,
    credential_result: Mutex<Option<ProviderError>>,
    connection: Mutex<Option<ConnectionDetails>>,
    bundles: Mutex<Vec<Bundle>>,
    pub create_calls: AtomicUsize,
    pub describe_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub reboot_calls: AtomicUsize,
    pub terminate_calls: AtomicUsize,
}

impl StubAdapter {
    pub fn new(provider: CloudProvider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            create_queue: Mutex::new(VecDeque::new()),
            describe_queue: Mutex::new(VecDeque::new()),
            lifecycle_queue: Mutex::new(VecDeque::new()),
            credential_result: Mutex::new(None),
            connection: Mutex::new(None),
            bundles: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            describe_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            reboot_calls: AtomicUsize::new(0),
            terminate_calls: AtomicUsize::new(0),
        })
    }

    pub fn push_create(&self, result: Result<CreatedDesktop, ProviderError>) {
        self.create_queue.lock().unwrap().push_back(result);
    }

    pub fn push_describe(&self, result: Result<DesktopSnapshot, ProviderError>) {
        self.describe_queue.lock().unwrap().push_back(result);
    }

    /// Queue `n` identical describe outcomes.
    pub fn push_describe_n(&self, result: Result<DesktopSnapshot, ProviderError>, n: usize) {
        let mut queue = self.describe_queue.lock().unwrap();
        for _ in 0..n {
            queue.push_back(result.clone());
        }
    }

    pub fn push_lifecycle(&self, result: Result<(), ProviderError>) {
        self.lifecycle_queue.lock().unwrap().push_back(result);
    }

    pub fn fail_credentials(&self, error: ProviderError) {
        *self.credential_result.lock().unwrap() = Some(error);
    }

    pub fn set_connection(&self, details: ConnectionDetails) {
        *self.connection.lock().unwrap() = Some(details);
    }

    pub fn set_bundles(&self, bundles: Vec<Bundle>) {
        *self.bundles.lock().unwrap() = bundles;
    }

    pub fn snapshot(state: DesktopState) -> DesktopSnapshot {
        DesktopSnapshot {
            state,
            raw_state: format!("{:?}", state).to_uppercase(),
            ip_address: Some("10.0.0.9".to_string()),
            computer_name: Some("STUB-HOST".to_string()),
            error_message: None,
        }
    }
}

#[async_trait]
impl CloudAdapter for StubAdapter {
    fn provider(&self) -> CloudProvider {
        self.provider
    }

    async fn create_desktop(&self, _spec: &DesktopSpec) -> Result<CreatedDesktop, ProviderError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst);
        match self.create_queue.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(CreatedDesktop {
                handle: format!("stub-{}", n),
            }),
        }
    }

    async fn describe_desktop(&self, _handle: &str) -> Result<DesktopSnapshot, ProviderError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        match self.describe_queue.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(Self::snapshot(DesktopState::Available)),
        }
    }

    async fn start_desktop(&self, _handle: &str) -> Result<(), ProviderError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.lifecycle_queue.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn stop_desktop(&self, _handle: &str) -> Result<(), ProviderError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.lifecycle_queue.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn reboot_desktop(&self, _handle: &str) -> Result<(), ProviderError> {
        self.reboot_calls.fetch_add(1, Ordering::SeqCst);
        self.lifecycle_queue.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn terminate_desktop(&self, _handle: &str) -> Result<(), ProviderError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.lifecycle_queue.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn connection_info(&self, handle: &str) -> Result<ConnectionDetails, ProviderError> {
        match self.connection.lock().unwrap().clone() {
            Some(details) => Ok(details),
            None => Ok(ConnectionDetails {
                connection_string: format!("stub://{}", handle),
                registration_code: None,
                ip_address: Some("10.0.0.9".to_string()),
                computer_name: Some("STUB-HOST".to_string()),
            }),
        }
    }

    async fn list_bundles(&self) -> Result<Vec<Bundle>, ProviderError> {
        Ok(self.bundles.lock().unwrap().clone())
    }

    async fn check_credentials(&self) -> Result<(), ProviderError> {
        match self.credential_result.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Factory handing out one shared scripted adapter regardless of the
/// credential it is asked for.
pub struct StubFactory {
    pub adapter: Arc<StubAdapter>,
}

impl StubFactory {
    pub fn new(adapter: Arc<StubAdapter>) -> Arc<Self> {
        Arc::new(Self { adapter })
    }
}

impl AdapterFactory for StubFactory {
    fn adapter(
        &self,
        _material: &CredentialMaterial,
    ) -> Result<Arc<dyn CloudAdapter>, ProviderError> {
        Ok(self.adapter.clone())
    }
}
