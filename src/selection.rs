use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml;

pub const CATALOG_URL: &str = "https://catalogue.dataspace.copernicus.eu/odata/v1/Products";
pub const TOKEN_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";
pub const DOWNLOAD_URL: &str = "https://download.dataspace.copernicus.eu/odata/v1";
pub const CLIENT_ID: &str = "cdse-public";

/// What to look for in the catalog and where to put it.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Selection {
    pub id: String,
    pub name: String,
    pub collection: String,
    pub tile_id: String,
    pub relative_orbit: String,
    pub product_level: String,
    pub start_date: String,
    pub end_date: String,
    pub download_dir: PathBuf,
    pub credentials: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub endpoints: Endpoints,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Endpoints {
    pub catalog: String,
    pub token: String,
    pub download: String,
    pub client_id: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            catalog: CATALOG_URL.to_string(),
            token: TOKEN_URL.to_string(),
            download: DOWNLOAD_URL.to_string(),
            client_id: CLIENT_ID.to_string(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

pub fn selection_toml() -> toml::Table {
    toml::toml! {
        id = "copernicus.sentinel2.T33SVB"

        name = "Sentinel-2 Level 2A, tile T33SVB, relative orbit R079"

        collection = "SENTINEL-2"
        tile_id = "T33SVB"
        relative_orbit = "R079"
        product_level = "MSIL2A"

        start_date = "2017-06-01T00:00:00.000Z"
        end_date = "2018-06-01T00:00:00.000Z"

        download_dir = "./outputs/tiles"
        credentials = "conf/config.json"
    }
}

impl Selection {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let selection: Self = toml::from_str(&content)?;
        selection.validate()?;
        Ok(selection)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let selection: Self = toml::from_str(&table.to_string())?;
        selection.validate()?;
        Ok(selection)
    }

    fn validate(&self) -> Result<()> {
        for endpoint in [
            &self.endpoints.catalog,
            &self.endpoints.token,
            &self.endpoints.download,
        ] {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow::anyhow!("Invalid endpoint '{}': {}", endpoint, e))?;
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// OData `$filter` expression sent with the first catalog request.
    pub fn filter_expression(&self) -> String {
        format!(
            "Collection/Name eq '{}' and \
             contains(Name, '{}') and \
             contains(Name, '{}') and \
             contains(Name, '{}') and \
             ContentDate/Start gt {} and \
             ContentDate/Start lt {}",
            self.collection,
            self.tile_id,
            self.relative_orbit,
            self.product_level,
            self.start_date,
            self.end_date,
        )
    }
}
