use crate::catalog::Product;
use crate::error::{DownloadError, DownloadExhaustedError, ReauthError, TaskError};
use crate::retry::RetryPolicy;
use crate::selection::Endpoints;
use crate::token::TokenManager;
use anyhow::Result;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub id: String,
    pub name: String,
    pub date: String,
    pub output: PathBuf,
}

impl DownloadTask {
    pub fn new(product: &Product, output_dir: &Path) -> Self {
        DownloadTask {
            id: product.id.clone(),
            name: product.name.clone(),
            date: product.acquisition_date().to_string(),
            output: output_dir.join(product.file_name()),
        }
    }
}

#[derive(Deserialize, Serialize, Debug)]
pub struct DownloadPlan {
    tasks: Vec<DownloadTask>,
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub attempted: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: Vec<DownloadExhaustedError>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Downloaded(u64),
}

/// The `Products(<id>)/$value` download endpoint.
pub struct DownloadEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl DownloadEndpoint {
    pub fn new(client: reqwest::Client, endpoints: &Endpoints) -> Self {
        Self {
            client,
            base_url: endpoints.download.trim_end_matches('/').to_string(),
        }
    }

    pub fn product_url(&self, id: &str) -> String {
        format!("{}/Products({})/$value", self.base_url, id)
    }

    async fn get(
        &self,
        id: &str,
        access_token: &str,
        offset: u64,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self
            .client
            .get(self.product_url(id))
            .header(AUTHORIZATION, format!("Bearer {access_token}"));
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        Ok(request.send().await?)
    }
}

impl DownloadPlan {
    /// One task per product, in the order given. Feed it the output of
    /// `select_latest` so the tasks run by acquisition date.
    pub fn new(products: &[Product], output_dir: &Path) -> Self {
        let tasks = products
            .iter()
            .map(|product| DownloadTask::new(product, output_dir))
            .collect();
        Self { tasks }
    }

    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    /// Reads a plan written by `write`. Tasks are put back in acquisition date order
    /// in case the file was edited by hand.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut plan: Self = serde_json::from_str(&content)?;
        plan.tasks.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Runs every task in order. A product that runs out of attempts is recorded in the
    /// summary and the next one starts; only a failed re-authentication stops the run.
    pub async fn execute(
        &self,
        endpoint: &DownloadEndpoint,
        tokens: &mut TokenManager,
        policy: &RetryPolicy,
    ) -> Result<DownloadSummary, ReauthError> {
        let mut summary = DownloadSummary::default();
        let total = self.tasks.len();

        for (i, task) in self.tasks.iter().enumerate() {
            info!(product = %task.name, "Product {} of {}", i + 1, total);

            match try_download(endpoint, tokens, policy, task).await {
                Ok(Outcome::Skipped) => summary.skipped += 1,
                Ok(Outcome::Downloaded(bytes)) => {
                    info!(product = %task.name, bytes, "Download complete");
                    summary.attempted += 1;
                    summary.completed += 1;
                }
                Err(TaskError::Exhausted(e)) => {
                    error!(error = %e, "Download failed");
                    summary.attempted += 1;
                    summary.failed.push(e);
                }
                Err(TaskError::Reauth(e)) => return Err(e),
            }
        }

        info!(
            attempted = summary.attempted,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            "Done"
        );
        Ok(summary)
    }
}

pub async fn try_download(
    endpoint: &DownloadEndpoint,
    tokens: &mut TokenManager,
    policy: &RetryPolicy,
    task: &DownloadTask,
) -> Result<Outcome, TaskError> {
    // Check if the output file already exists; return early if so
    if task.output.exists() {
        info!(output = %task.output.display(), "Output file already exists");
        return Ok(Outcome::Skipped);
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = fetch(endpoint, tokens.access_token(), task).await;
        match result {
            Ok(bytes) => return Ok(Outcome::Downloaded(bytes)),
            Err(e) => {
                warn!(product = %task.name, attempt, error = %e, "Download attempt failed");
                if !policy.should_retry(attempt) {
                    return Err(DownloadExhaustedError {
                        product: task.name.clone(),
                        attempts: attempt,
                        last: e,
                    }
                    .into());
                }
                tokens.handle_expiry().await?;
            }
        }
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut partial = output.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}

fn progress_bar(total: u64, name: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(name.to_string());
    pb
}

/// Total payload size from a `Content-Range: bytes */<len>` header.
fn complete_length(response: &reqwest::Response) -> Option<u64> {
    let content_range = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    content_range.rsplit('/').next()?.trim().parse().ok()
}

/// One attempt: streams the payload into `<output>.partial`, resuming from whatever is
/// already there, and renames it into place once the body is complete.
async fn fetch(
    endpoint: &DownloadEndpoint,
    access_token: &str,
    task: &DownloadTask,
) -> Result<u64, DownloadError> {
    // Make parent directories as necessary
    if let Some(parent_dir) = task.output.parent() {
        fs::create_dir_all(parent_dir)?;
    }

    let partial = partial_path(&task.output);
    let offset = fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);

    let mut response = endpoint.get(&task.id, access_token, offset).await?;
    if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        if complete_length(&response) == Some(offset) {
            info!(output = %task.output.display(), "Partial file already complete");
            fs::rename(&partial, &task.output)?;
            return Ok(offset);
        }
        warn!(offset, "Partial file does not match the remote payload, starting over");
        fs::remove_file(&partial)?;
        response = endpoint.get(&task.id, access_token, 0).await?;
    }

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status(status));
    }

    let (mut file, mut byte_count) = if status == StatusCode::PARTIAL_CONTENT {
        info!(offset, "Resuming download");
        (OpenOptions::new().append(true).open(&partial)?, offset)
    } else {
        (File::create(&partial)?, 0)
    };

    let total_size = response
        .content_length()
        .map(|len| len + byte_count)
        .unwrap_or(0);
    let pb = progress_bar(total_size, &task.name);
    pb.set_position(byte_count);

    let mut stream = response.bytes_stream();
    while let Some(bytes) = stream.next().await {
        let bytes = bytes?;
        file.write_all(&bytes)?;
        byte_count += bytes.len() as u64;
        pb.set_position(byte_count);
    }
    file.flush()?;
    pb.finish_and_clear();

    // Rename the file to remove .partial suffix
    fs::rename(&partial, &task.output)?;
    Ok(byte_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ContentDate;
    use crate::token::{TokenEndpoint, TokenPair};
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn product(id: &str, name: &str, start: &str) -> Product {
        Product {
            id: id.to_string(),
            name: name.to_string(),
            content_date: ContentDate {
                start: start.to_string(),
                end: None,
            },
            s3_path: None,
        }
    }

    fn endpoints(server: &MockServer) -> Endpoints {
        Endpoints {
            token: server.url("/token"),
            download: server.url("/odata/v1"),
            ..Endpoints::default()
        }
    }

    fn setup(server: &MockServer, dir: &TempDir) -> (DownloadEndpoint, TokenManager) {
        let client = reqwest::Client::new();
        let endpoints = endpoints(server);
        let credentials = dir.path().join("config.json");
        fs::write(&credentials, r#"{"username": "user", "password": "secret"}"#).unwrap();

        let tokens = TokenManager::with_tokens(
            TokenEndpoint::new(client.clone(), &endpoints),
            credentials,
            TokenPair {
                access_token: "a1".to_string(),
                refresh_token: "r1".to_string(),
            },
        );
        (DownloadEndpoint::new(client, &endpoints), tokens)
    }

    fn task(dir: &TempDir, id: &str) -> DownloadTask {
        let p = product(id, &format!("S2A_MSIL2A_{id}_N0500_R079.SAFE"), "2017-06-11T00:00:00Z");
        DownloadTask::new(&p, &dir.path().join("tiles"))
    }

    #[test]
    fn test_task_output_path() {
        let p = product(
            "abc",
            "S2A_MSIL2A_20170611T095031_N0205_R079_T33SVB_20170611T095446.SAFE",
            "2017-06-11T09:50:31.026Z",
        );
        let task = DownloadTask::new(&p, Path::new("/data/tiles"));
        assert_eq!(
            task.output,
            PathBuf::from(
                "/data/tiles/S2A_MSIL2A_20170611T095031_N0205_R079_T33SVB_20170611T095446.zip"
            )
        );
        assert_eq!(task.date, "2017-06-11");
    }

    #[test]
    fn test_write_and_read_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download_plan.json");
        let products = vec![
            product("1", "A_N0400_X.SAFE", "2017-06-01T00:00:00Z"),
            product("2", "B_N0400_X.SAFE", "2017-06-11T00:00:00Z"),
            product("3", "C_N0400_X.SAFE", "2017-06-21T00:00:00Z"),
        ];
        let plan = DownloadPlan::new(&products, dir.path());
        plan.write(&path).unwrap();

        let read = DownloadPlan::read(&path).unwrap();
        assert_eq!(read.tasks(), plan.tasks());
        assert_eq!(read.tasks().len(), 3);
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).body("unused");
            })
            .await;

        let dir = TempDir::new().unwrap();
        let (endpoint, mut tokens) = setup(&server, &dir);
        let task = task(&dir, "abc");
        fs::create_dir_all(task.output.parent().unwrap()).unwrap();
        fs::write(&task.output, b"already here").unwrap();

        let outcome = try_download(&endpoint, &mut tokens, &RetryPolicy::default(), &task)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Skipped);
        mock.assert_hits_async(0).await;
        assert_eq!(fs::read(&task.output).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn test_download() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/odata/v1/Products(abc)/$value")
                    .header("authorization", "Bearer a1");
                then.status(200).body("payload");
            })
            .await;

        let dir = TempDir::new().unwrap();
        let (endpoint, mut tokens) = setup(&server, &dir);
        let task = task(&dir, "abc");

        let outcome = try_download(&endpoint, &mut tokens, &RetryPolicy::default(), &task)
            .await
            .unwrap();

        mock.assert_hits_async(1).await;
        assert_eq!(outcome, Outcome::Downloaded(7));
        assert_eq!(fs::read(&task.output).unwrap(), b"payload");
        assert!(!partial_path(&task.output).exists());
    }

    #[tokio::test]
    async fn test_resumes_partial_file() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/odata/v1/Products(abc)/$value")
                    .header("range", "bytes=6-");
                then.status(206).body("world");
            })
            .await;

        let dir = TempDir::new().unwrap();
        let (endpoint, mut tokens) = setup(&server, &dir);
        let task = task(&dir, "abc");
        fs::create_dir_all(task.output.parent().unwrap()).unwrap();
        fs::write(partial_path(&task.output), b"hello ").unwrap();

        let outcome = try_download(&endpoint, &mut tokens, &RetryPolicy::default(), &task)
            .await
            .unwrap();

        mock.assert_hits_async(1).await;
        assert_eq!(outcome, Outcome::Downloaded(11));
        assert_eq!(fs::read(&task.output).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_full_response_replaces_partial() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/odata/v1/Products(abc)/$value");
                then.status(200).body("payload");
            })
            .await;

        let dir = TempDir::new().unwrap();
        let (endpoint, mut tokens) = setup(&server, &dir);
        let task = task(&dir, "abc");
        fs::create_dir_all(task.output.parent().unwrap()).unwrap();
        fs::write(partial_path(&task.output), b"stale").unwrap();

        let outcome = try_download(&endpoint, &mut tokens, &RetryPolicy::default(), &task)
            .await
            .unwrap();

        mock.assert_hits_async(1).await;
        assert_eq!(outcome, Outcome::Downloaded(7));
        assert_eq!(fs::read(&task.output).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_complete_partial_is_kept_on_range_not_satisfiable() {
        let server = MockServer::start_async().await;
        let ranged = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/odata/v1/Products(abc)/$value")
                    .header("range", "bytes=7-");
                then.status(416).header("content-range", "bytes */7");
            })
            .await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .json_body(json!({"access_token": "a2", "refresh_token": "r2"}));
            })
            .await;

        let dir = TempDir::new().unwrap();
        let (endpoint, mut tokens) = setup(&server, &dir);
        let task = task(&dir, "abc");
        fs::create_dir_all(task.output.parent().unwrap()).unwrap();
        fs::write(partial_path(&task.output), b"payload").unwrap();

        let outcome = try_download(&endpoint, &mut tokens, &RetryPolicy::default(), &task)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Downloaded(7));
        assert_eq!(fs::read(&task.output).unwrap(), b"payload");
        assert!(!partial_path(&task.output).exists());
        ranged.assert_hits_async(1).await;
        token.assert_hits_async(0).await;
    }

    #[test]
    fn test_read_restores_date_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download_plan.json");
        let products = vec![
            product("3", "C_N0400_X.SAFE", "2017-06-21T00:00:00Z"),
            product("1", "A_N0400_X.SAFE", "2017-06-01T00:00:00Z"),
            product("2", "B_N0400_X.SAFE", "2017-06-11T00:00:00Z"),
        ];
        DownloadPlan::new(&products, dir.path()).write(&path).unwrap();

        let plan = DownloadPlan::read(&path).unwrap();
        let ids: Vec<_> = plan.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_retries_with_new_token_after_reauth() {
        let server = MockServer::start_async().await;
        let stale = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/odata/v1/Products(abc)/$value")
                    .header("authorization", "Bearer a1");
                then.status(401);
            })
            .await;
        let fresh = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/odata/v1/Products(abc)/$value")
                    .header("authorization", "Bearer a3");
                then.status(200).body("payload");
            })
            .await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=refresh_token");
                then.status(400).body("invalid_grant");
            })
            .await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=password");
                then.status(200)
                    .json_body(json!({"access_token": "a3", "refresh_token": "r3"}));
            })
            .await;

        let dir = TempDir::new().unwrap();
        let (endpoint, mut tokens) = setup(&server, &dir);
        let task = task(&dir, "abc");

        let outcome = try_download(&endpoint, &mut tokens, &RetryPolicy::default(), &task)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Downloaded(7));
        stale.assert_hits_async(1).await;
        fresh.assert_hits_async(1).await;
        refresh.assert_hits_async(1).await;
        login.assert_hits_async(1).await;
        assert_eq!(tokens.access_token(), "a3");
    }

    #[tokio::test]
    async fn test_exhausted_product_does_not_stop_run() {
        let server = MockServer::start_async().await;
        let bad = server
            .mock_async(|when, then| {
                when.method(GET).path("/odata/v1/Products(bad)/$value");
                then.status(500);
            })
            .await;
        let good = server
            .mock_async(|when, then| {
                when.method(GET).path("/odata/v1/Products(good)/$value");
                then.status(200).body("payload");
            })
            .await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=refresh_token");
                then.status(200)
                    .json_body(json!({"access_token": "a2", "refresh_token": "r2"}));
            })
            .await;

        let dir = TempDir::new().unwrap();
        let (endpoint, mut tokens) = setup(&server, &dir);
        let products = vec![
            product("bad", "A_N0500_X.SAFE", "2017-06-01T00:00:00Z"),
            product("good", "B_N0500_X.SAFE", "2017-06-11T00:00:00Z"),
        ];
        let plan = DownloadPlan::new(&products, dir.path());

        let summary = plan
            .execute(&endpoint, &mut tokens, &RetryPolicy::default())
            .await
            .unwrap();

        bad.assert_hits_async(3).await;
        good.assert_hits_async(1).await;
        // No refresh after the final attempt
        refresh.assert_hits_async(2).await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].product, "A_N0500_X.SAFE");
        assert_eq!(summary.failed[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_failed_reauth_aborts_run() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/odata/v1/Products(first)/$value");
                then.status(401);
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET).path("/odata/v1/Products(second)/$value");
                then.status(200).body("payload");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(401).body("account locked");
            })
            .await;

        let dir = TempDir::new().unwrap();
        let (endpoint, mut tokens) = setup(&server, &dir);
        let products = vec![
            product("first", "A_N0500_X.SAFE", "2017-06-01T00:00:00Z"),
            product("second", "B_N0500_X.SAFE", "2017-06-11T00:00:00Z"),
        ];
        let plan = DownloadPlan::new(&products, dir.path());

        let result = plan
            .execute(&endpoint, &mut tokens, &RetryPolicy::default())
            .await;

        assert!(matches!(result, Err(ReauthError::Auth(_))));
        second.assert_hits_async(0).await;
    }
}
