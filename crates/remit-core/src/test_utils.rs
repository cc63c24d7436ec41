//! Test utilities for remit-core
//!
//! This module provides testing infrastructure: a mock Ollama server that
//! answers extraction prompts with canned JSON, and an in-memory payer
//! directory that counts the calls made against it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use axum::{
    extract::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::aliases::name_tokens;
use crate::error::{Error, Result};
use crate::matcher::{DirectoryLookup, DirectoryQuery};
use crate::models::{AddressUpdateProposal, NewPayerRequest, PayerDirectoryEntry};

/// Mock Ollama server for testing and development
pub struct MockOllamaServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockOllamaServer {
    /// Start the mock server on an available port
    pub async fn start() -> Self {
        let app = Router::new()
            .route("/api/tags", get(handle_tags))
            .route("/api/generate", post(handle_generate));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock Ollama server");
        let addr = listener.local_addr().expect("mock server address");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await;
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockOllamaServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Ollama tags endpoint response (health check)
async fn handle_tags() -> Json<TagsResponse> {
    Json(TagsResponse {
        models: vec![ModelInfo {
            name: "llama3.2-vision:latest".to_string(),
            modified_at: "2025-01-01T00:00:00Z".to_string(),
            size: 7_900_000_000,
        }],
    })
}

/// Ollama generate endpoint
///
/// Picks a canned answer from the prompt wording in prompts/*.md.
async fn handle_generate(Json(request): Json<GenerateRequest>) -> Json<GenerateResponse> {
    let response = if request.prompt.contains("deposit log or deposit slip") {
        LEDGER_RESPONSE
    } else if request.prompt.contains("online payment receipt") {
        ONLINE_RESPONSE
    } else if request.images.is_empty() && !request.prompt.contains("Document text:") {
        "I could not find a document in this request."
    } else {
        CHECK_RESPONSE
    };

    Json(GenerateResponse {
        model: request.model,
        response: response.to_string(),
        done: true,
    })
}

const CHECK_RESPONSE: &str = r#"Sure, here is the check:
{"payments": [{
  "payment": {"amount": "1,500.00", "amount_written": "One thousand five hundred and 00/100",
              "check_no_or_ref": "4531", "check_date": "01/16/2025", "postmark_date": null, "memo": "Dues"},
  "payer": {"names": ["Dalene Eimon"], "organization": null},
  "contact": {"address": {"line1": "805 Snead St", "city": "Paso Robles", "state": "CA", "zip": "93446"},
              "return_address": null, "email": null, "phone": null}
}]}"#;

const LEDGER_RESPONSE: &str = r#"{"payments": [
  {"line": 1, "payment": {"amount": "1500.00", "check_no_or_ref": "4531", "deposit_date": "02/08/2025", "deposit_method": "check"},
   "payer": {"names": ["D. Eimon"]}},
  {"line": 2, "payment": {"amount": 40, "check_no_or_ref": 1042, "deposit_date": "02/08/2025", "deposit_method": "check"},
   "payer": {"names": []}}
]}"#;

const ONLINE_RESPONSE: &str = r#"{"payments": [
  {"payment": {"amount": "75.00", "check_no_or_ref": "stripe_9981", "payment_date": "2025-01-20T17:04:11Z"},
   "payer": {"names": ["Dalene Eimon"]},
   "contact": {"email": "dalene@example.com"}}
]}"#;

// Request/Response types for the mock server

#[derive(Debug, Serialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    name: String,
    modified_at: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    images: Vec<String>,
    #[allow(dead_code)]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    model: String,
    response: String,
    done: bool,
}

/// Payer directory held in memory
///
/// `find_candidates` returns every entry sharing a name token with the
/// query. Bulk calls and the queries they carried are counted.
pub struct InMemoryDirectory {
    entries: RwLock<Vec<PayerDirectoryEntry>>,
    available: bool,
    bulk_calls: AtomicUsize,
    queries_seen: AtomicUsize,
}

impl InMemoryDirectory {
    pub fn new(entries: Vec<PayerDirectoryEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
            available: true,
            bulk_calls: AtomicUsize::new(0),
            queries_seen: AtomicUsize::new(0),
        }
    }

    /// A directory whose every call fails
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Total queries carried by bulk calls
    pub fn queries_seen(&self) -> usize {
        self.queries_seen.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<PayerDirectoryEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::DirectoryUnavailable(
                "in-memory directory is offline".into(),
            ))
        }
    }
}

#[async_trait]
impl DirectoryLookup for InMemoryDirectory {
    async fn find_candidates(
        &self,
        aliases: &[String],
        organization: Option<&str>,
    ) -> Result<Vec<PayerDirectoryEntry>> {
        self.ensure_available()?;
        let wanted = name_tokens(aliases.iter().map(String::as_str).chain(organization));

        let entries = self
            .entries
            .read()
            .map_err(|_| Error::DirectoryUnavailable("directory lock poisoned".into()))?;
        Ok(entries
            .iter()
            .filter(|entry| {
                let have = name_tokens(
                    std::iter::once(entry.display_name.as_str())
                        .chain(entry.aliases.iter().map(String::as_str))
                        .chain(entry.organization_name.as_deref()),
                );
                have.iter().any(|t| wanted.contains(t))
            })
            .cloned()
            .collect())
    }

    async fn find_candidates_bulk(
        &self,
        queries: &[DirectoryQuery],
    ) -> Result<Vec<Vec<PayerDirectoryEntry>>> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.queries_seen.fetch_add(queries.len(), Ordering::SeqCst);
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(
                self.find_candidates(&query.aliases, query.organization.as_deref())
                    .await?,
            );
        }
        Ok(results)
    }

    async fn create_entry(&self, request: &NewPayerRequest) -> Result<String> {
        self.ensure_available()?;
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::DirectoryUnavailable("directory lock poisoned".into()))?;
        let id = format!("mem-{}", entries.len() + 1);
        entries.push(PayerDirectoryEntry {
            id: id.clone(),
            display_name: request.display_name.clone(),
            aliases: request.aliases.clone(),
            organization_name: request.organization_name.clone(),
            address: request.address.clone(),
            email: request.email.clone(),
            phone: request.phone.clone(),
        });
        Ok(id)
    }

    async fn update_address(&self, proposal: &AddressUpdateProposal) -> Result<()> {
        self.ensure_available()?;
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::DirectoryUnavailable("directory lock poisoned".into()))?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == proposal.payer_directory_id)
            .ok_or_else(|| Error::NotFound(format!("payer {}", proposal.payer_directory_id)))?;
        entry.address = Some(proposal.proposed.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{DocumentExtractor, OllamaExtractor};

    fn entry(id: &str, name: &str) -> PayerDirectoryEntry {
        PayerDirectoryEntry {
            id: id.into(),
            display_name: name.into(),
            aliases: vec![name.into()],
            organization_name: None,
            address: None,
            email: None,
            phone: None,
        }
    }

    #[tokio::test]
    async fn test_mock_server_health_check() {
        let server = MockOllamaServer::start().await;
        let extractor = OllamaExtractor::new(&server.url(), "test-model");
        assert!(extractor.health_check().await);
    }

    #[tokio::test]
    async fn test_directory_candidates_share_a_token() {
        let directory = InMemoryDirectory::new(vec![
            entry("p1", "Dalene Eimon"),
            entry("p2", "Mara Lind"),
        ]);
        let found = directory
            .find_candidates(&["Eimon, D.".to_string()], None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "p1");
    }

    #[tokio::test]
    async fn test_directory_create_and_update() {
        let directory = InMemoryDirectory::new(vec![]);
        let id = directory
            .create_entry(&NewPayerRequest {
                fingerprint: "pay_1".into(),
                display_name: "Mara Lind".into(),
                aliases: vec!["Mara Lind".into()],
                organization_name: None,
                salutation: None,
                address: None,
                email: None,
                phone: None,
            })
            .await
            .unwrap();
        assert_eq!(directory.entries().len(), 1);

        let missing = directory
            .update_address(&AddressUpdateProposal {
                fingerprint: "pay_1".into(),
                payer_directory_id: "nope".into(),
                current: None,
                proposed: Default::default(),
                differing_fields: vec![],
            })
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));

        directory
            .update_address(&AddressUpdateProposal {
                fingerprint: "pay_1".into(),
                payer_directory_id: id,
                current: None,
                proposed: crate::models::Address {
                    zip: Some("93446".into()),
                    ..Default::default()
                },
                differing_fields: vec!["zip".into()],
            })
            .await
            .unwrap();
        assert!(directory.entries()[0].address.is_some());
    }

    #[tokio::test]
    async fn test_unavailable_directory_fails_every_call() {
        let directory = InMemoryDirectory::unavailable();
        assert!(matches!(
            directory.find_candidates(&["Mara Lind".into()], None).await,
            Err(Error::DirectoryUnavailable(_))
        ));
    }
}
