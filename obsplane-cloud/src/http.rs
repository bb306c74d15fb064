//! HTTP implementation of the provider traits.
//!
//! One injected `reqwest::Client` plus per-resource-kind request helpers; no
//! resource type wraps or extends the client. Only the documented status
//! codes and payload shapes are interpreted; everything else surfaces as an
//! opaque [`ApiError`].

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::pending::{OperationStatus, PendingOperation};
use crate::provider::{
    BucketInfo, ComputeProvider, IamPolicy, IamProvider, RouteInfo, ServiceAccountInfo,
    StorageProvider, SubnetworkInfo,
};

/// Base URLs of the provider API surfaces.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub compute: String,
    pub storage: String,
    pub iam: String,
    pub resourcemanager: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            compute: "https://compute.googleapis.com/compute/v1".into(),
            storage: "https://storage.googleapis.com/storage/v1".into(),
            iam: "https://iam.googleapis.com/v1".into(),
            resourcemanager: "https://cloudresourcemanager.googleapis.com/v1".into(),
        }
    }
}

pub struct HttpProvider {
    client: reqwest::Client,
    endpoints: ProviderEndpoints,
    project: String,
    token: Option<String>,
}

impl HttpProvider {
    pub fn new(client: reqwest::Client, endpoints: ProviderEndpoints, project: &str) -> Self {
        Self {
            client,
            endpoints,
            project: project.to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ApiError::transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            let message = extract_error_message(&body).unwrap_or_else(|| body.clone());
            return Err(ApiError::new(status, message));
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| ApiError::transport(format!("unexpected response body: {}", e)))
    }

    fn compute_url(&self, path: &str) -> String {
        format!(
            "{}/projects/{}/{}",
            self.endpoints.compute, self.project, path
        )
    }

    /// Extracts the operation handle from a mutation response.
    fn operation_from(&self, value: &Value) -> Result<PendingOperation, ApiError> {
        value
            .get("name")
            .and_then(Value::as_str)
            .map(PendingOperation::new)
            .ok_or_else(|| ApiError::transport("operation response without a name"))
    }

    /// Existence probe shared by direct-lookup resources: 200 is present,
    /// 404 is absent, anything else propagates.
    async fn lookup_exists(&self, url: &str) -> Result<bool, ApiError> {
        match self.send(self.client.get(url)).await {
            Ok(_) => Ok(true),
            Err(e) if e.status == 404 => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Provider error bodies nest the human-readable message under
/// `error.message`.
fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn items_array(value: &Value) -> Result<&Vec<Value>, ApiError> {
    match value.get("items") {
        None => {
            // An omitted items field is an empty listing.
            static EMPTY: Vec<Value> = Vec::new();
            Ok(&EMPTY)
        }
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(ApiError::transport("list response items is not an array")),
    }
}

fn last_segment(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(|s| s.rsplit('/').next().unwrap_or(s).to_string())
}

#[async_trait]
impl ComputeProvider for HttpProvider {
    async fn network_exists(&self, name: &str) -> Result<bool, ApiError> {
        let url = self.compute_url(&format!("global/networks/{}", name));
        self.lookup_exists(&url).await
    }

    async fn create_network(&self, name: &str) -> Result<(), ApiError> {
        let url = self.compute_url("global/networks");
        let body = json!({ "name": name, "autoCreateSubnetworks": false });
        self.send(self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> Result<PendingOperation, ApiError> {
        let url = self.compute_url(&format!("global/networks/{}", name));
        let value = self.send(self.client.delete(&url)).await?;
        self.operation_from(&value)
    }

    async fn list_subnetworks(&self) -> Result<Vec<SubnetworkInfo>, ApiError> {
        let url = self.compute_url("aggregated/subnetworks");
        let value = self.send(self.client.get(&url)).await?;
        let mut subnets = Vec::new();
        for item in items_array(&value)? {
            let name = item.get("name").and_then(Value::as_str);
            let region = last_segment(item, "region");
            let network = item.get("network").and_then(Value::as_str);
            match (name, region, network) {
                (Some(name), Some(region), Some(network)) => subnets.push(SubnetworkInfo {
                    name: name.to_string(),
                    region,
                    network: network.to_string(),
                }),
                _ => {
                    return Err(ApiError::transport(
                        "subnetwork list entry missing name/region/network",
                    ));
                }
            }
        }
        Ok(subnets)
    }

    async fn create_subnetwork(
        &self,
        region: &str,
        network: &str,
        name: &str,
        cidr: &str,
    ) -> Result<(), ApiError> {
        let url = self.compute_url(&format!("regions/{}/subnetworks", region));
        let body = json!({
            "name": name,
            "network": network,
            "ipCidrRange": cidr,
            "privateIpGoogleAccess": true,
        });
        self.send(self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn delete_subnetwork(
        &self,
        region: &str,
        name: &str,
    ) -> Result<PendingOperation, ApiError> {
        let url = self.compute_url(&format!("regions/{}/subnetworks/{}", region, name));
        let value = self.send(self.client.delete(&url)).await?;
        self.operation_from(&value)
    }

    async fn router_exists(&self, region: &str, name: &str) -> Result<bool, ApiError> {
        let url = self.compute_url(&format!("regions/{}/routers/{}", region, name));
        self.lookup_exists(&url).await
    }

    async fn create_router(
        &self,
        region: &str,
        name: &str,
        network: &str,
    ) -> Result<(), ApiError> {
        let url = self.compute_url(&format!("regions/{}/routers", region));
        let body = json!({
            "name": name,
            "network": format!("projects/{}/global/networks/{}", self.project, network),
            "nats": [{
                "name": name,
                "natIpAllocateOption": "AUTO_ONLY",
                "sourceSubnetworkIpRangesToNat": "ALL_SUBNETWORKS_ALL_IP_RANGES",
            }],
        });
        self.send(self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn delete_router(&self, region: &str, name: &str) -> Result<(), ApiError> {
        let url = self.compute_url(&format!("regions/{}/routers/{}", region, name));
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn list_routes(&self) -> Result<Vec<RouteInfo>, ApiError> {
        let url = self.compute_url("global/routes");
        let value = self.send(self.client.get(&url)).await?;
        let items = items_array(&value)?;
        serde_json::from_value(Value::Array(items.clone()))
            .map_err(|e| ApiError::transport(format!("unexpected route list entry: {}", e)))
    }

    async fn delete_route(&self, name: &str) -> Result<(), ApiError> {
        let url = self.compute_url(&format!("global/routes/{}", name));
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn operation_status(&self, op: &PendingOperation) -> Result<OperationStatus, ApiError> {
        let url = self.compute_url(&format!("global/operations/{}", op.handle));
        let value = self.send(self.client.get(&url)).await?;
        let status = value.get("status").and_then(Value::as_str).unwrap_or("");
        if status != "DONE" {
            return Ok(OperationStatus::Running);
        }
        match value.get("error") {
            Some(err) if !err.is_null() => Ok(OperationStatus::Failed(ApiError::new(
                500,
                err.to_string(),
            ))),
            _ => Ok(OperationStatus::Done),
        }
    }
}

#[async_trait]
impl StorageProvider for HttpProvider {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, ApiError> {
        let url = format!("{}/b?project={}", self.endpoints.storage, self.project);
        let value = self.send(self.client.get(&url)).await?;
        let items = items_array(&value)?;
        serde_json::from_value(Value::Array(items.clone()))
            .map_err(|e| ApiError::transport(format!("unexpected bucket list entry: {}", e)))
    }

    async fn create_bucket(&self, name: &str, location: &str) -> Result<(), ApiError> {
        let url = format!("{}/b?project={}", self.endpoints.storage, self.project);
        let body = json!({ "name": name, "location": location });
        self.send(self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn set_bucket_lifecycle(&self, name: &str, days: u32) -> Result<(), ApiError> {
        let url = format!("{}/b/{}", self.endpoints.storage, name);
        // PATCH with a full lifecycle object replaces the rule set.
        let body = json!({
            "lifecycle": {
                "rule": [{
                    "action": { "type": "Delete" },
                    "condition": { "age": days },
                }],
            },
        });
        self.send(self.client.patch(&url).json(&body)).await?;
        Ok(())
    }
}

#[async_trait]
impl IamProvider for HttpProvider {
    async fn get_service_account(
        &self,
        email: &str,
    ) -> Result<Option<ServiceAccountInfo>, ApiError> {
        let url = format!(
            "{}/projects/{}/serviceAccounts/{}",
            self.endpoints.iam, self.project, email
        );
        match self.send(self.client.get(&url)).await {
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ApiError::transport(format!("unexpected service account: {}", e))),
            Err(e) if e.status == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_service_account(
        &self,
        account_id: &str,
    ) -> Result<ServiceAccountInfo, ApiError> {
        let url = format!(
            "{}/projects/{}/serviceAccounts",
            self.endpoints.iam, self.project
        );
        let body = json!({ "accountId": account_id });
        let value = self.send(self.client.post(&url).json(&body)).await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::transport(format!("unexpected service account: {}", e)))
    }

    async fn delete_service_account(&self, email: &str) -> Result<(), ApiError> {
        let url = format!(
            "{}/projects/{}/serviceAccounts/{}",
            self.endpoints.iam, self.project, email
        );
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn get_project_policy(&self) -> Result<IamPolicy, ApiError> {
        let url = format!(
            "{}/projects/{}:getIamPolicy",
            self.endpoints.resourcemanager, self.project
        );
        let value = self.send(self.client.post(&url)).await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::transport(format!("unexpected policy: {}", e)))
    }

    async fn set_project_policy(&self, policy: &IamPolicy) -> Result<(), ApiError> {
        let url = format!(
            "{}/projects/{}:setIamPolicy",
            self.endpoints.resourcemanager, self.project
        );
        let body = json!({ "policy": policy });
        self.send(self.client.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn set_workload_identity_binding(
        &self,
        sa_email: &str,
        cluster_service_account: &str,
    ) -> Result<(), ApiError> {
        let url = format!(
            "{}/projects/{}/serviceAccounts/{}:setIamPolicy",
            self.endpoints.iam, self.project, sa_email
        );
        // This account is fully managed here, so the policy is asserted
        // wholesale instead of read-modify-write.
        let member = format!(
            "serviceAccount:{}.svc.id.goog[{}]",
            self.project, cluster_service_account
        );
        let body = json!({
            "policy": {
                "bindings": [{
                    "role": "roles/iam.workloadIdentityUser",
                    "members": [member],
                }],
            },
        });
        self.send(self.client.post(&url).json(&body)).await?;
        Ok(())
    }
}
