use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::ScanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    #[default]
    Domain,
    Subdomain,
    Ip,
    Cname,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    #[default]
    Active,
    Inactive,
    Suspicious,
    ConfirmedMalicious,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: Uuid,
    pub domain: String,
    pub ip_address: Option<String>,
    pub ip_owner: Option<String>,
    pub asset_type: AssetType,
    pub status: AssetStatus,
    pub risk_score: f64,
    pub metadata: Option<Json<serde_json::Value>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Minimal asset projection embedded in scan listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: Uuid,
    pub domain: String,
}

/// Lifecycle of a scan job.
///
/// `PENDING -> RUNNING -> {COMPLETED | FAILED | CANCELLED}`, with
/// `PENDING -> CANCELLED` allowed for jobs still waiting in the queue.
/// The three right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ScanError::InvalidInput(format!("unknown scan status: {other}"))),
        }
    }
}

/// Reconnaissance tools known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolType {
    Subfinder,
    Httpx,
    Nuclei,
    Katana,
    Dnsx,
    Ffuf,
    Gospider,
    Waybackurls,
    Shuffledns,
    Cewl,
    Assetfinder,
    Metabigor,
    Sublist3r,
    Subdomainizer,
    GithubRecon,
    CloudEnum,
    Linkfinder,
}

impl ToolType {
    pub const ALL: [ToolType; 17] = [
        Self::Subfinder,
        Self::Httpx,
        Self::Nuclei,
        Self::Katana,
        Self::Dnsx,
        Self::Ffuf,
        Self::Gospider,
        Self::Waybackurls,
        Self::Shuffledns,
        Self::Cewl,
        Self::Assetfinder,
        Self::Metabigor,
        Self::Sublist3r,
        Self::Subdomainizer,
        Self::GithubRecon,
        Self::CloudEnum,
        Self::Linkfinder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subfinder => "SUBFINDER",
            Self::Httpx => "HTTPX",
            Self::Nuclei => "NUCLEI",
            Self::Katana => "KATANA",
            Self::Dnsx => "DNSX",
            Self::Ffuf => "FFUF",
            Self::Gospider => "GOSPIDER",
            Self::Waybackurls => "WAYBACKURLS",
            Self::Shuffledns => "SHUFFLEDNS",
            Self::Cewl => "CEWL",
            Self::Assetfinder => "ASSETFINDER",
            Self::Metabigor => "METABIGOR",
            Self::Sublist3r => "SUBLIST3R",
            Self::Subdomainizer => "SUBDOMAINIZER",
            Self::GithubRecon => "GITHUB_RECON",
            Self::CloudEnum => "CLOUD_ENUM",
            Self::Linkfinder => "LINKFINDER",
        }
    }

    /// Label stored on result rows.
    pub fn result_type(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolType {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| ScanError::UnknownTool(s.trim().to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub tool_type: ToolType,
    pub status: ScanStatus,
    pub command: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub execution_time: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub result_type: String,
    pub data: Json<serde_json::Value>,
    pub line_number: i64,
    pub created_at: DateTime<Utc>,
}

/// Job row joined with its asset domain and result-row count.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScanListRow {
    #[sqlx(flatten)]
    pub scan: ScanJob,
    pub asset_domain: String,
    pub result_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanListItem {
    #[serde(flatten)]
    pub scan: ScanJob,
    pub asset: AssetRef,
    pub result_count: i64,
}

impl From<ScanListRow> for ScanListItem {
    fn from(row: ScanListRow) -> Self {
        Self {
            asset: AssetRef {
                id: row.scan.asset_id,
                domain: row.asset_domain,
            },
            scan: row.scan,
            result_count: row.result_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDetail {
    #[serde(flatten)]
    pub scan: ScanJob,
    pub asset: Asset,
    pub scan_results: Vec<ScanResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageMeta {
    pub total: i64,
    pub skip: i64,
    pub take: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFilter {
    pub asset_id: Option<Uuid>,
    pub tool_type: Option<ToolType>,
    pub status: Option<ScanStatus>,
    pub skip: Option<i64>,
    pub take: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAsset {
    pub domain: String,
    pub ip_address: Option<String>,
    pub ip_owner: Option<String>,
    pub asset_type: Option<AssetType>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetUpdate {
    pub domain: Option<String>,
    pub ip_address: Option<String>,
    pub ip_owner: Option<String>,
    pub asset_type: Option<AssetType>,
    pub status: Option<AssetStatus>,
    pub risk_score: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetOrderBy {
    RiskScore,
    #[default]
    LastSeenAt,
    CreatedAt,
}

impl AssetOrderBy {
    pub fn column(&self) -> &'static str {
        match self {
            Self::RiskScore => "risk_score",
            Self::LastSeenAt => "last_seen_at",
            Self::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetQuery {
    pub skip: Option<i64>,
    pub take: Option<i64>,
    pub search: Option<String>,
    pub order_by: Option<AssetOrderBy>,
    pub order: Option<SortOrder>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStats {
    pub total: i64,
    pub by_status: std::collections::BTreeMap<String, i64>,
    pub avg_risk_score: f64,
}
