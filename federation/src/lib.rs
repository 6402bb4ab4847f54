//! keyfed federation client
//!
//! Registers this backend's callback with the federation gateway, uploads
//! consented keys of the local origin and downloads the batches of peer
//! countries into the key store.

// Error types and result
pub mod error;
pub use error::{FederationError, Result};

// Configuration
pub mod config;
pub use config::FederationConfig;

// Gateway interface and HTTP client
pub mod gateway;
pub mod http;
pub use gateway::{BatchUploadResponse, CallbackRegistration, DownloadedBatch, FederationGateway, SignedBatch};
pub use http::HttpGateway;

// Federation jobs
pub mod download;
pub mod registration;
pub mod upload;
pub use download::{DownloadReport, DownloadRunner};
pub use registration::{register_callback, RegistrationOutcome};
pub use upload::{UploadReport, UploadRunner};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use keyfed_core::models::ReportType;
    use keyfed_core::{DiagnosisKey, SigningProvider};

    use crate::error::{FederationError, Result};
    use crate::gateway::{
        BatchUploadResponse, CallbackRegistration, DownloadedBatch, FederationGateway, SignedBatch, WireKey,
    };

    /// Key valid on 2020-04-28
    pub fn key(seed: u8, origin: &str, visited: &[&str], submission_hour: u32) -> DiagnosisKey {
        DiagnosisKey {
            key_data: vec![seed; 16],
            rolling_start_interval_number: 2_646_720,
            rolling_period: 144,
            transmission_risk_level: 4,
            submission_timestamp: submission_hour,
            origin_country: origin.to_string(),
            visited_countries: visited.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
            report_type: ReportType::ConfirmedTest,
            days_since_onset_of_symptoms: Some(1),
            consent_to_federation: true,
        }
    }

    pub fn signer() -> SigningProvider {
        SigningProvider::from_seed([2u8; 32], "keyfed", "v1").unwrap()
    }

    #[derive(Debug, Clone)]
    pub enum UploadBehavior {
        AcceptAll,
        /// Answer 400 for these keys
        Reject(Vec<Vec<u8>>),
        /// Answer 500 for these keys the first time they are seen
        FailOnce(Vec<Vec<u8>>),
        /// Leave these keys out of the response
        Omit(Vec<Vec<u8>>),
        Unreachable,
    }

    struct StoredBatch {
        date: NaiveDate,
        batch: DownloadedBatch,
    }

    struct State {
        calls: usize,
        callbacks: Vec<CallbackRegistration>,
        upload_behavior: UploadBehavior,
        uploaded: Vec<DiagnosisKey>,
        batches: Vec<StoredBatch>,
        downloads: Vec<String>,
    }

    /// In-memory gateway
    pub struct FakeGateway {
        state: Mutex<State>,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            FakeGateway {
                state: Mutex::new(State {
                    calls: 0,
                    callbacks: Vec::new(),
                    upload_behavior: UploadBehavior::AcceptAll,
                    uploaded: Vec::new(),
                    batches: Vec::new(),
                    downloads: Vec::new(),
                }),
            }
        }

        pub fn calls(&self) -> usize {
            self.state.lock().unwrap().calls
        }

        pub fn callbacks(&self) -> Vec<CallbackRegistration> {
            self.state.lock().unwrap().callbacks.clone()
        }

        /// Keys accepted with 201
        pub fn uploaded(&self) -> Vec<DiagnosisKey> {
            self.state.lock().unwrap().uploaded.clone()
        }

        /// Tags of every batch served
        pub fn downloads(&self) -> Vec<String> {
            self.state.lock().unwrap().downloads.clone()
        }

        pub fn set_upload_behavior(&self, behavior: UploadBehavior) {
            self.state.lock().unwrap().upload_behavior = behavior;
        }

        pub fn add_batch(&self, date: NaiveDate, tag: &str, next: Option<&str>, keys: Vec<WireKey>) {
            self.push_batch(date, tag, next, keys, None);
        }

        pub fn add_signed_batch(
            &self,
            date: NaiveDate,
            tag: &str,
            next: Option<&str>,
            keys: Vec<WireKey>,
            signature: Vec<u8>,
        ) {
            self.push_batch(date, tag, next, keys, Some(signature));
        }

        fn push_batch(
            &self,
            date: NaiveDate,
            tag: &str,
            next: Option<&str>,
            keys: Vec<WireKey>,
            signature: Option<Vec<u8>>,
        ) {
            self.state.lock().unwrap().batches.push(StoredBatch {
                date,
                batch: DownloadedBatch {
                    batch_tag: tag.to_string(),
                    next_batch_tag: next.map(str::to_string),
                    keys,
                    signature,
                },
            });
        }
    }

    #[async_trait]
    impl FederationGateway for FakeGateway {
        async fn list_callbacks(&self) -> Result<Vec<CallbackRegistration>> {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            Ok(state.callbacks.clone())
        }

        async fn put_callback(&self, registration: &CallbackRegistration) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            state.callbacks.retain(|c| c.id != registration.id);
            state.callbacks.push(registration.clone());
            Ok(())
        }

        async fn upload_batch(&self, batch: &SignedBatch) -> Result<BatchUploadResponse> {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            let mut response = BatchUploadResponse::default();
            for (index, key) in batch.keys.iter().enumerate() {
                match &mut state.upload_behavior {
                    UploadBehavior::Unreachable => {
                        return Err(FederationError::Transport("connection refused".to_string()))
                    }
                    UploadBehavior::Reject(rejected) if rejected.contains(&key.key_data) => {
                        response.status400.push(index);
                        continue;
                    }
                    UploadBehavior::Omit(omitted) if omitted.contains(&key.key_data) => continue,
                    UploadBehavior::FailOnce(failing) if failing.contains(&key.key_data) => {
                        failing.retain(|k| k != &key.key_data);
                        response.status500.push(index);
                        continue;
                    }
                    _ => {}
                }
                if state.uploaded.iter().any(|k| k.key_data == key.key_data) {
                    response.status409.push(index);
                } else {
                    response.status201.push(index);
                    state.uploaded.push(key.clone());
                }
            }
            Ok(response)
        }

        async fn download_batch(&self, date: NaiveDate, batch_tag: Option<&str>) -> Result<Option<DownloadedBatch>> {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            let found = state
                .batches
                .iter()
                .filter(|b| b.date == date)
                .find(|b| batch_tag.map_or(true, |tag| b.batch.batch_tag == tag))
                .map(|b| b.batch.clone());
            if let Some(batch) = &found {
                state.downloads.push(batch.batch_tag.clone());
            }
            Ok(found)
        }
    }
}
