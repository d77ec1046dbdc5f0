//! Static tool table: which container a recon tool lives in and how its
//! argument list is built for a target domain.

use std::collections::HashMap;

use crate::{config::AppConfig, error::ScanError, models::ToolType};

const DOMAIN: &str = "{domain}";

/// `(tool, container suffix, argv template)`. `{domain}` is substituted
/// inside each argument; arguments are never re-split or passed to a shell.
const TOOL_TABLE: &[(ToolType, &str, &[&str])] = &[
    (ToolType::Subfinder, "subfinder", &["subfinder", "-d", DOMAIN, "-silent"]),
    (ToolType::Httpx, "httpx", &["httpx", "-u", DOMAIN, "-silent", "-json"]),
    (ToolType::Nuclei, "nuclei", &["nuclei", "-u", DOMAIN, "-silent", "-json"]),
    (ToolType::Katana, "katana", &["katana", "-u", DOMAIN, "-silent"]),
    (ToolType::Dnsx, "dnsx", &["dnsx", "-d", DOMAIN, "-silent"]),
    (
        ToolType::Ffuf,
        "ffuf",
        &["ffuf", "-u", "https://{domain}/FUZZ", "-w", "/wordlists/common.txt", "-o", "/dev/stdout"],
    ),
    (ToolType::Gospider, "gospider", &["gospider", "-s", "https://{domain}", "-q"]),
    (ToolType::Waybackurls, "waybackurls", &["waybackurls", DOMAIN]),
    (ToolType::Shuffledns, "shuffledns", &["shuffledns", "-d", DOMAIN, "-silent"]),
    (ToolType::Cewl, "cewl", &["cewl", "https://{domain}", "-d", "2"]),
    (ToolType::Assetfinder, "assetfinder", &["assetfinder", DOMAIN]),
    (ToolType::Metabigor, "metabigor", &["metabigor", "net", "-org", DOMAIN]),
    (ToolType::Sublist3r, "sublist3r", &["sublist3r", "-d", DOMAIN, "-o", "/dev/stdout"]),
    (
        ToolType::Subdomainizer,
        "subdomainizer",
        &["python3", "SubDomainizer.py", "-u", "https://{domain}"],
    ),
    (ToolType::GithubRecon, "github-recon", &["github-recon", DOMAIN]),
    (ToolType::CloudEnum, "cloud-enum", &["cloud_enum", "-k", DOMAIN]),
    (ToolType::Linkfinder, "linkfinder", &["linkfinder", "-i", "https://{domain}", "-o", "cli"]),
];

/// Invocation recipe for one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRecipe {
    pub tool: ToolType,
    /// Name of the container (execution target) the tool runs in.
    pub container: String,
    template: &'static [&'static str],
}

impl ToolRecipe {
    pub fn argv(&self, domain: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| arg.replace(DOMAIN, domain))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    recipes: HashMap<ToolType, ToolRecipe>,
}

impl ToolRegistry {
    pub fn new(container_prefix: &str, disabled: &[ToolType]) -> Self {
        let recipes = TOOL_TABLE
            .iter()
            .filter(|(tool, _, _)| !disabled.contains(tool))
            .map(|&(tool, suffix, template)| {
                (
                    tool,
                    ToolRecipe {
                        tool,
                        container: format!("{container_prefix}{suffix}"),
                        template,
                    },
                )
            })
            .collect();
        Self { recipes }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(&cfg.container_prefix, &cfg.disabled_tools)
    }

    pub fn resolve(&self, tool: ToolType) -> Result<&ToolRecipe, ScanError> {
        self.recipes
            .get(&tool)
            .ok_or_else(|| ScanError::UnknownTool(tool.to_string()))
    }

    /// Registered tools in table order.
    pub fn tools(&self) -> Vec<ToolType> {
        ToolType::ALL
            .into_iter()
            .filter(|tool| self.recipes.contains_key(tool))
            .collect()
    }
}
