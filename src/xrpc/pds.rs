//! Repository reads against an account's PDS.

use async_trait::async_trait;
use std::time::Duration;

use super::XrpcClient;
use crate::errors::XrpcError;
use crate::repo_fetch::{ListRecordsPage, RepoFetcher};

const LIST_RECORDS: &str = "com.atproto.repo.listRecords";

#[derive(Clone, Debug)]
pub struct PdsRepoClient {
    http_client: reqwest::Client,
    call_timeout: Duration,
    page_size: u32,
}

impl PdsRepoClient {
    pub fn new(http_client: reqwest::Client, call_timeout: Duration) -> Self {
        Self {
            http_client,
            call_timeout,
            page_size: 100,
        }
    }
}

#[async_trait]
impl RepoFetcher for PdsRepoClient {
    async fn list_records(
        &self,
        pds: &str,
        did: &str,
        collection: &str,
        cursor: Option<&str>,
    ) -> Result<ListRecordsPage, XrpcError> {
        let client = XrpcClient::new(self.http_client.clone(), pds, self.call_timeout);
        let mut params = vec![
            ("repo", did.to_string()),
            ("collection", collection.to_string()),
            ("limit", self.page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        client.query(LIST_RECORDS, &params).await
    }
}
