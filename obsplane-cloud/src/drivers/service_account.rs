//! IAM service account driver.
//!
//! Existence is probed by derived email address, because the provider's
//! opaque unique id is unknown before creation. Creation is cheap to retry,
//! so failures are not classified finely: everything short of a 404 maps to
//! backoff-and-retry. After the account exists, the project policy binding
//! and the workload-identity link are (re)applied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::convergence::{Driver, Probe};
use crate::error::{ApiError, CloudError, ErrorClass};
use crate::pending::PendingOperation;
use crate::provider::{IamPolicy, IamProvider, PolicyBinding};
use crate::resource::{ResourceDescriptor, ResourceKind, Tuning};

fn default_tuning() -> Tuning {
    Tuning::new(Duration::from_secs(5), Duration::from_secs(5))
}

/// Adds `member` to the policy binding for `role`, creating the binding if
/// absent. Returns false when the member was already present.
pub fn add_policy_member(policy: &mut IamPolicy, role: &str, member: &str) -> bool {
    for binding in policy.bindings.iter_mut() {
        if binding.role == role {
            if binding.members.iter().any(|m| m == member) {
                return false;
            }
            binding.members.push(member.to_string());
            return true;
        }
    }
    policy.bindings.push(PolicyBinding {
        role: role.to_string(),
        members: vec![member.to_string()],
    });
    true
}

/// Removes `member` from the policy binding for `role`. Returns false when
/// nothing changed.
pub fn remove_policy_member(policy: &mut IamPolicy, role: &str, member: &str) -> bool {
    let mut changed = false;
    for binding in policy.bindings.iter_mut() {
        if binding.role == role {
            let before = binding.members.len();
            binding.members.retain(|m| m != member);
            changed |= binding.members.len() != before;
        }
    }
    changed
}

pub struct ServiceAccountDriver {
    iam: Arc<dyn IamProvider>,
    descriptor: ResourceDescriptor,
    tuning: Tuning,
    email: String,
    role: String,
    cluster_service_account: String,
}

impl ServiceAccountDriver {
    pub fn new(
        iam: Arc<dyn IamProvider>,
        account_id: &str,
        project: &str,
        role: &str,
        cluster_service_account: &str,
    ) -> Self {
        let email = format!("{}@{}.iam.gserviceaccount.com", account_id, project);
        Self {
            iam,
            descriptor: ResourceDescriptor::global(ResourceKind::ServiceAccount, account_id, project),
            tuning: default_tuning(),
            email,
            role: role.to_string(),
            cluster_service_account: cluster_service_account.to_string(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    async fn ensure_policy_binding(&self) -> Result<(), ApiError> {
        let mut policy = self.iam.get_project_policy().await?;
        let member = format!("serviceAccount:{}", self.email);
        if add_policy_member(&mut policy, &self.role, &member) {
            debug!(member = %member, role = %self.role, "adding project policy binding");
            self.iam.set_project_policy(&policy).await?;
        }
        Ok(())
    }

    async fn remove_policy_binding(&self) -> Result<(), ApiError> {
        let mut policy = self.iam.get_project_policy().await?;
        let member = format!("serviceAccount:{}", self.email);
        if remove_policy_member(&mut policy, &self.role, &member) {
            debug!(member = %member, role = %self.role, "removing project policy binding");
            self.iam.set_project_policy(&policy).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for ServiceAccountDriver {
    fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    async fn probe(&mut self) -> Result<Probe, CloudError> {
        let account = self
            .iam
            .get_service_account(&self.email)
            .await
            .map_err(|e| CloudError::Fatal {
                descriptor: self.descriptor.clone(),
                source: e,
            })?;
        Ok(if account.is_some() {
            Probe::Exists
        } else {
            Probe::Absent
        })
    }

    async fn create(&mut self) -> Result<(), ApiError> {
        self.iam
            .create_service_account(&self.descriptor.name)
            .await?;
        Ok(())
    }

    async fn post_exists(&mut self) -> Result<(), ApiError> {
        self.ensure_policy_binding().await?;
        self.iam
            .set_workload_identity_binding(&self.email, &self.cluster_service_account)
            .await?;
        Ok(())
    }

    /// Strip the policy binding before deleting the account. Failures here
    /// postpone the delete rather than aborting it.
    async fn pre_delete(&mut self) -> Result<bool, CloudError> {
        match self.remove_policy_binding().await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(account = %self.email, error = %e, "policy binding removal failed, will retry");
                Ok(false)
            }
        }
    }

    async fn delete(&mut self) -> Result<Option<PendingOperation>, ApiError> {
        self.iam.delete_service_account(&self.email).await?;
        Ok(None)
    }

    fn classify(&self, err: &ApiError) -> ErrorClass {
        match err.status {
            404 => ErrorClass::NotFound,
            _ => ErrorClass::DependencyNotReady,
        }
    }
}
