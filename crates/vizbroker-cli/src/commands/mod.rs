//! CLI commands implementation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;
use vizbroker_core::{AllocatedItem, GroupId, Node, RequestItem, Resource, UserId};

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Launcher response from API
#[derive(Debug, Deserialize)]
pub struct LauncherResponse {
    pub id: Uuid,
    pub backend: String,
    pub hosts: Vec<String>,
}

/// Allocation response from API
#[derive(Debug, Deserialize)]
pub struct AllocationResponse {
    pub id: Uuid,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub created_at: String,
    pub hosts: Vec<String>,
    pub items: Vec<AllocatedItem>,
    pub launchers: Vec<LauncherResponse>,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub nodes: usize,
    pub resources: usize,
    pub free_resources: usize,
    pub allocations: usize,
    pub unusable_nodes: Vec<String>,
    pub backends: Vec<String>,
}

#[derive(Serialize)]
struct AllocateRequest {
    user_id: UserId,
    group_id: GroupId,
    include_nodes: Vec<String>,
    request: Vec<RequestItem>,
}

/// Read a request file: a JSON list of request items
fn load_request(path: &Path) -> Result<Vec<RequestItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_request(&content).with_context(|| format!("Invalid request in {}", path.display()))
}

fn parse_request(content: &str) -> Result<Vec<RequestItem>> {
    let items: Vec<RequestItem> = serde_json::from_str(content)?;
    if items.is_empty() {
        anyhow::bail!("request is empty");
    }
    Ok(items)
}

/// Allocate resources
pub async fn allocate(
    client: &ApiClient,
    file: &Path,
    user: UserId,
    group: GroupId,
    include: Vec<String>,
) -> Result<()> {
    let req = AllocateRequest {
        user_id: user,
        group_id: group,
        include_nodes: include,
        request: load_request(file)?,
    };

    let response = client
        .client
        .post(client.url("/api/v1/allocations"))
        .json(&req)
        .send()
        .await?;

    if response.status().is_success() {
        let allocation: AllocationResponse = response.json().await?;
        println!("Allocation {} granted", allocation.id);
        print_allocation_details(&allocation);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to allocate: {}", error);
    }

    Ok(())
}

/// Release an allocation
pub async fn release(client: &ApiClient, id: Uuid) -> Result<()> {
    let response = client
        .client
        .delete(client.url(&format!("/api/v1/allocations/{}", id)))
        .send()
        .await?;

    if response.status().is_success() {
        println!("Allocation {} released", id);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to release allocation: {}", error);
    }

    Ok(())
}

/// List allocations, or show one in detail
pub async fn allocations(client: &ApiClient, id: Option<Uuid>) -> Result<()> {
    match id {
        Some(id) => {
            let response = client
                .client
                .get(client.url(&format!("/api/v1/allocations/{}", id)))
                .send()
                .await?;

            if response.status().is_success() {
                let allocation: AllocationResponse = response.json().await?;
                println!("Allocation: {}", allocation.id);
                print_allocation_details(&allocation);
            } else {
                let error = response.text().await?;
                eprintln!("Allocation not found: {}", error);
            }
        }
        None => {
            let response = client
                .client
                .get(client.url("/api/v1/allocations"))
                .send()
                .await?;

            if response.status().is_success() {
                let allocations: Vec<AllocationResponse> = response.json().await?;

                if allocations.is_empty() {
                    println!("No allocations found");
                } else {
                    println!(
                        "{:<36} {:<8} {:<8} {:<26} {}",
                        "ID", "USER", "GROUP", "CREATED", "HOSTS"
                    );
                    println!("{}", "-".repeat(100));
                    for a in allocations {
                        println!(
                            "{:<36} {:<8} {:<8} {:<26} {}",
                            a.id,
                            a.user_id,
                            a.group_id,
                            a.created_at,
                            a.hosts.join(",")
                        );
                    }
                }
            } else {
                let error = response.text().await?;
                eprintln!("Failed to list allocations: {}", error);
            }
        }
    }

    Ok(())
}

/// List resources
pub async fn resources(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/resources"))
        .send()
        .await?;

    if response.status().is_success() {
        let resources: Vec<Resource> = response.json().await?;

        if resources.is_empty() {
            println!("No resources configured");
        } else {
            println!("{:<40} {:<24} {}", "RESOURCE", "TYPE", "OWNERS");
            println!("{}", "-".repeat(80));
            for res in resources {
                println!(
                    "{:<40} {:<24} {}",
                    res.to_string(),
                    res.res_type.as_deref().unwrap_or("-"),
                    format_owners(&res)
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list resources: {}", error);
    }

    Ok(())
}

/// List nodes
pub async fn nodes(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/nodes")).send().await?;

    if response.status().is_success() {
        let nodes: Vec<Node> = response.json().await?;

        println!("{:<6} {:<24} {:<8} {}", "INDEX", "HOST", "WEIGHT", "MODEL");
        for node in nodes {
            println!(
                "{:<6} {:<24} {:<8} {}",
                node.index,
                node.host_name,
                node.weight,
                node.model.as_deref().unwrap_or("-")
            );
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list nodes: {}", error);
    }

    Ok(())
}

/// Show broker status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("vizbroker v{}", status.version);
        println!();
        println!("Nodes: {}", status.nodes);
        println!(
            "Resources: {} total, {} free",
            status.resources, status.free_resources
        );
        println!("Allocations: {}", status.allocations);
        println!("Backends: {}", status.backends.join(", "));
        if !status.unusable_nodes.is_empty() {
            println!("Unusable nodes: {}", status.unusable_nodes.join(", "));
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

fn format_owners(res: &Resource) -> String {
    if res.owners.is_empty() {
        return "free".to_string();
    }
    let owners: Vec<String> = res.owners.iter().map(|o| o.to_string()).collect();
    if res.shared {
        format!("{} (shared, limit {})", owners.join(","), res.max_share_count)
    } else {
        owners.join(",")
    }
}

/// Helper to print allocation details
fn print_allocation_details(allocation: &AllocationResponse) {
    println!("  User: {}  Group: {}", allocation.user_id, allocation.group_id);
    println!("  Created: {}", allocation.created_at);
    println!("  Hosts: {}", allocation.hosts.join(", "));
    for (i, item) in allocation.items.iter().enumerate() {
        match item {
            AllocatedItem::Node(grant) => {
                println!("  [{}] node {}", i, grant.host_name);
            }
            AllocatedItem::Group(group) => {
                println!("  [{}] group {}", i, group.name.as_deref().unwrap_or("-"));
            }
            _ => {}
        }
        for res in item.resources() {
            println!("      {}", res);
        }
    }
    for launcher in &allocation.launchers {
        println!(
            "  Launcher {} ({}) on {}",
            launcher.id,
            launcher.backend,
            launcher.hosts.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_trims_trailing_slash() {
        let client = ApiClient::new("http://localhost:9191/");
        assert_eq!(
            client.url("/api/v1/status"),
            "http://localhost:9191/api/v1/status"
        );
    }

    #[test]
    fn test_parse_request() {
        let items = parse_request(
            r#"[{"resource": {"class": "gpu"}}, [{"resource": {"class": "server"}}, {"resource": {"class": "keyboard"}}]]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], RequestItem::CoLocated(ref list) if list.len() == 2));

        assert!(parse_request("[]").is_err());
        assert!(parse_request("{").is_err());
    }

    #[test]
    fn test_format_owners() {
        let free = Resource::gpu().with_index(0).on_host("viz1");
        assert_eq!(format_owners(&free), "free");

        let mut busy = free.clone();
        busy.owners = vec![1000];
        assert_eq!(format_owners(&busy), "1000");
    }
}
