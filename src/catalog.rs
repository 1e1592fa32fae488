use crate::error::PaginationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static BASELINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_N(\d{4})_").expect("Regex pattern should always compile"));

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ContentDate {
    #[serde(rename = "Start")]
    pub start: String,
    #[serde(rename = "End", default)]
    pub end: Option<String>,
}

/// A catalog entry, e.g. `S2A_MSIL2A_20170611T095031_N0205_R079_T33SVB_20170611T095446.SAFE`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Product {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ContentDate")]
    pub content_date: ContentDate,
    #[serde(rename = "S3Path", default)]
    pub s3_path: Option<String>,
}

impl Product {
    /// The `YYYY-MM-DD` part of the acquisition start timestamp.
    pub fn acquisition_date(&self) -> &str {
        let start = self.content_date.start.as_str();
        start.get(..10).unwrap_or(start)
    }

    /// Processing baseline parsed from the `_N<4 digits>_` part of the name.
    pub fn baseline(&self) -> Option<u16> {
        let captures = BASELINE.captures(&self.name)?;
        captures[1].parse().ok()
    }

    /// Local file name: the name up to its first '.', with a `.zip` suffix.
    pub fn file_name(&self) -> String {
        let stem = self.name.split('.').next().unwrap_or(&self.name);
        format!("{stem}.zip")
    }
}

#[derive(Deserialize)]
struct Page {
    value: Vec<Product>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Products collected from the catalog. `interrupted` is set when a page failed and
/// `products` only holds what came before it.
#[derive(Debug, Default)]
pub struct Listing {
    pub products: Vec<Product>,
    pub pages: usize,
    pub interrupted: Option<PaginationError>,
}

async fn fetch_page(
    client: &reqwest::Client,
    url: &str,
    query: Option<&[(&str, &str)]>,
) -> Result<Page, PaginationError> {
    let transport = |source: reqwest::Error| PaginationError::Transport {
        url: url.to_string(),
        source,
    };

    let mut request = client.get(url);
    if let Some(query) = query {
        request = request.query(query);
    }

    let response = request.send().await.map_err(transport)?;
    let status = response.status();
    if !status.is_success() {
        return Err(PaginationError::Status {
            url: url.to_string(),
            status,
        });
    }
    response.json::<Page>().await.map_err(transport)
}

/// Walks the paged listing at `base_url`. Only the first request carries the filter and
/// ordering; later requests follow `@odata.nextLink` as given by the server.
pub async fn fetch_products(client: &reqwest::Client, base_url: &str, filter: &str) -> Listing {
    let mut listing = Listing::default();
    let first_query = [("$filter", filter), ("$orderby", "ContentDate/Start asc")];

    let mut visited = HashSet::new();
    let mut next = Some(base_url.to_string());
    while let Some(url) = next.take() {
        if !visited.insert(url.clone()) {
            let e = PaginationError::RepeatedLink { url };
            warn!(error = %e, "Catalog pagination stopped early");
            listing.interrupted = Some(e);
            break;
        }
        let query = (listing.pages == 0).then_some(&first_query[..]);

        match fetch_page(client, &url, query).await {
            Ok(page) => {
                listing.pages += 1;
                debug!(page = listing.pages, entries = page.value.len(), "Fetched catalog page");
                listing.products.extend(page.value);
                next = page.next_link;
            }
            Err(e) => {
                warn!(error = %e, "Catalog pagination stopped early");
                listing.interrupted = Some(e);
            }
        }
    }

    info!(
        products = listing.products.len(),
        pages = listing.pages,
        "Catalog listing complete"
    );
    listing
}
