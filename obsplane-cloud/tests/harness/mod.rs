//! In-memory fake provider shared by the convergence integration tests.
//!
//! Mutations and probes are recorded in a chronological call log so tests
//! can assert ordering (e.g. routes drained before the network delete).
//! Error sequences can be scripted per mutation to simulate conflicts,
//! not-ready rejections and flaky creates.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use obsplane_cloud::error::ApiError;
use obsplane_cloud::pending::{OperationStatus, PendingOperation};
use obsplane_cloud::provider::{
    BucketInfo, ComputeProvider, IamPolicy, IamProvider, RouteInfo, ServiceAccountInfo,
    StorageProvider, SubnetworkInfo,
};

/// Deferred effect applied when a pending operation completes.
#[derive(Debug, Clone)]
pub enum OpEffect {
    RemoveNetwork(String),
    RemoveSubnetwork(String),
}

#[derive(Debug)]
pub struct OpState {
    pub polls_remaining: u32,
    pub error: Option<ApiError>,
    pub effect: OpEffect,
}

#[derive(Default)]
pub struct FakeState {
    pub networks: Vec<String>,
    pub subnetworks: Vec<SubnetworkInfo>,
    pub routers: Vec<(String, String)>,
    pub routes: Vec<RouteInfo>,
    /// bucket name → history of lifecycle days applied, latest last.
    pub buckets: BTreeMap<String, Vec<u32>>,
    pub accounts: Vec<ServiceAccountInfo>,
    pub policy: IamPolicy,
    pub workload_identity: Vec<(String, String)>,

    pub operations: HashMap<String, OpState>,
    next_op: u32,

    /// Scripted error prefixes consumed before a mutation succeeds.
    pub create_network_errors: VecDeque<ApiError>,
    pub create_subnetwork_errors: VecDeque<ApiError>,
    pub create_router_errors: VecDeque<ApiError>,
    pub create_bucket_errors: VecDeque<ApiError>,
    pub create_account_errors: VecDeque<ApiError>,
    pub list_subnetworks_errors: VecDeque<ApiError>,

    /// When true, create_network reports 409 while the resource appears
    /// anyway (a concurrent creator won the race).
    pub conflict_on_create_network: bool,

    /// Extra poll cycles before a delete operation resolves.
    pub delete_polls: u32,
    /// Terminal error for the next delete operation.
    pub delete_operation_error: Option<ApiError>,

    pub calls: Vec<String>,
}

impl FakeState {
    fn log(&mut self, call: impl Into<String>) {
        self.calls.push(call.into());
    }

    fn new_operation(&mut self, effect: OpEffect) -> PendingOperation {
        self.next_op += 1;
        let handle = format!("op-{}", self.next_op);
        self.operations.insert(
            handle.clone(),
            OpState {
                polls_remaining: self.delete_polls,
                error: self.delete_operation_error.take(),
                effect,
            },
        );
        PendingOperation::new(handle)
    }

    fn apply(&mut self, effect: &OpEffect) {
        match effect {
            OpEffect::RemoveNetwork(name) => self.networks.retain(|n| n != name),
            OpEffect::RemoveSubnetwork(name) => self.subnetworks.retain(|s| &s.name != name),
        }
    }
}

#[derive(Clone)]
pub struct FakeCloud {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Index of the first call starting with `prefix`, if any.
    pub fn first_index(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    pub fn seed_network(&self, name: &str) {
        self.with(|s| s.networks.push(name.to_string()));
    }

    pub fn seed_subnetwork(&self, name: &str, region: &str, network: &str) {
        self.with(|s| {
            s.subnetworks.push(SubnetworkInfo {
                name: name.to_string(),
                region: region.to_string(),
                network: format!("projects/p/global/networks/{}", network),
            })
        });
    }

    pub fn seed_route(&self, name: &str, network: &str) {
        self.with(|s| {
            s.routes.push(RouteInfo {
                name: name.to_string(),
                network: format!("projects/p/global/networks/{}", network),
                next_hop_network: None,
            })
        });
    }
}

#[async_trait]
impl ComputeProvider for FakeCloud {
    async fn network_exists(&self, name: &str) -> Result<bool, ApiError> {
        self.with(|s| {
            s.log(format!("network_exists:{}", name));
            Ok(s.networks.iter().any(|n| n == name))
        })
    }

    async fn create_network(&self, name: &str) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("create_network:{}", name));
            if let Some(err) = s.create_network_errors.pop_front() {
                return Err(err);
            }
            if s.conflict_on_create_network {
                s.networks.push(name.to_string());
                return Err(ApiError::new(409, "network already exists"));
            }
            s.networks.push(name.to_string());
            Ok(())
        })
    }

    async fn delete_network(&self, name: &str) -> Result<PendingOperation, ApiError> {
        self.with(|s| {
            s.log(format!("delete_network:{}", name));
            if !s.networks.iter().any(|n| n == name) {
                return Err(ApiError::new(404, "network not found"));
            }
            Ok(s.new_operation(OpEffect::RemoveNetwork(name.to_string())))
        })
    }

    async fn list_subnetworks(&self) -> Result<Vec<SubnetworkInfo>, ApiError> {
        self.with(|s| {
            s.log("list_subnetworks");
            if let Some(err) = s.list_subnetworks_errors.pop_front() {
                return Err(err);
            }
            Ok(s.subnetworks.clone())
        })
    }

    async fn create_subnetwork(
        &self,
        region: &str,
        network: &str,
        name: &str,
        _cidr: &str,
    ) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("create_subnetwork:{}", name));
            if let Some(err) = s.create_subnetwork_errors.pop_front() {
                return Err(err);
            }
            s.subnetworks.push(SubnetworkInfo {
                name: name.to_string(),
                region: region.to_string(),
                network: network.to_string(),
            });
            Ok(())
        })
    }

    async fn delete_subnetwork(
        &self,
        _region: &str,
        name: &str,
    ) -> Result<PendingOperation, ApiError> {
        self.with(|s| {
            s.log(format!("delete_subnetwork:{}", name));
            if !s.subnetworks.iter().any(|sn| sn.name == name) {
                return Err(ApiError::new(404, "subnetwork not found"));
            }
            Ok(s.new_operation(OpEffect::RemoveSubnetwork(name.to_string())))
        })
    }

    async fn router_exists(&self, region: &str, name: &str) -> Result<bool, ApiError> {
        self.with(|s| {
            s.log(format!("router_exists:{}", name));
            Ok(s.routers
                .iter()
                .any(|(rg, n)| rg == region && n == name))
        })
    }

    async fn create_router(
        &self,
        region: &str,
        name: &str,
        _network: &str,
    ) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("create_router:{}", name));
            if let Some(err) = s.create_router_errors.pop_front() {
                return Err(err);
            }
            if s.routers.iter().any(|(rg, n)| rg == region && n == name) {
                return Err(ApiError::new(409, "router already exists"));
            }
            s.routers.push((region.to_string(), name.to_string()));
            Ok(())
        })
    }

    async fn delete_router(&self, region: &str, name: &str) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("delete_router:{}", name));
            let before = s.routers.len();
            s.routers.retain(|(rg, n)| !(rg == region && n == name));
            if s.routers.len() == before {
                return Err(ApiError::new(404, "router not found"));
            }
            Ok(())
        })
    }

    async fn list_routes(&self) -> Result<Vec<RouteInfo>, ApiError> {
        self.with(|s| {
            s.log("list_routes");
            Ok(s.routes.clone())
        })
    }

    async fn delete_route(&self, name: &str) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("delete_route:{}", name));
            let before = s.routes.len();
            s.routes.retain(|r| r.name != name);
            if s.routes.len() == before {
                return Err(ApiError::new(404, "route not found"));
            }
            Ok(())
        })
    }

    async fn operation_status(&self, op: &PendingOperation) -> Result<OperationStatus, ApiError> {
        self.with(|s| {
            s.log(format!("operation_status:{}", op.handle));
            let Some(state) = s.operations.get_mut(&op.handle) else {
                return Err(ApiError::new(404, "operation not found"));
            };
            if state.polls_remaining > 0 {
                state.polls_remaining -= 1;
                return Ok(OperationStatus::Running);
            }
            if let Some(err) = state.error.clone() {
                return Ok(OperationStatus::Failed(err));
            }
            let effect = state.effect.clone();
            s.apply(&effect);
            Ok(OperationStatus::Done)
        })
    }
}

#[async_trait]
impl StorageProvider for FakeCloud {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, ApiError> {
        self.with(|s| {
            s.log("list_buckets");
            Ok(s.buckets
                .keys()
                .map(|name| BucketInfo {
                    name: name.clone(),
                    location: "region-1".into(),
                })
                .collect())
        })
    }

    async fn create_bucket(&self, name: &str, _location: &str) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("create_bucket:{}", name));
            if let Some(err) = s.create_bucket_errors.pop_front() {
                return Err(err);
            }
            if s.buckets.contains_key(name) {
                return Err(ApiError::new(409, "bucket already exists"));
            }
            s.buckets.insert(name.to_string(), Vec::new());
            Ok(())
        })
    }

    async fn set_bucket_lifecycle(&self, name: &str, days: u32) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("set_bucket_lifecycle:{}:{}", name, days));
            match s.buckets.get_mut(name) {
                Some(history) => {
                    history.push(days);
                    Ok(())
                }
                None => Err(ApiError::new(404, "bucket not found")),
            }
        })
    }
}

#[async_trait]
impl IamProvider for FakeCloud {
    async fn get_service_account(
        &self,
        email: &str,
    ) -> Result<Option<ServiceAccountInfo>, ApiError> {
        self.with(|s| {
            s.log(format!("get_service_account:{}", email));
            Ok(s.accounts.iter().find(|a| a.email == email).cloned())
        })
    }

    async fn create_service_account(
        &self,
        account_id: &str,
    ) -> Result<ServiceAccountInfo, ApiError> {
        self.with(|s| {
            s.log(format!("create_service_account:{}", account_id));
            if let Some(err) = s.create_account_errors.pop_front() {
                return Err(err);
            }
            let info = ServiceAccountInfo {
                name: format!("projects/p/serviceAccounts/{}", account_id),
                email: format!("{}@p.iam.gserviceaccount.com", account_id),
                project_id: "p".into(),
            };
            s.accounts.push(info.clone());
            Ok(info)
        })
    }

    async fn delete_service_account(&self, email: &str) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("delete_service_account:{}", email));
            let before = s.accounts.len();
            s.accounts.retain(|a| a.email != email);
            if s.accounts.len() == before {
                return Err(ApiError::new(404, "service account not found"));
            }
            Ok(())
        })
    }

    async fn get_project_policy(&self) -> Result<IamPolicy, ApiError> {
        self.with(|s| {
            s.log("get_project_policy");
            Ok(s.policy.clone())
        })
    }

    async fn set_project_policy(&self, policy: &IamPolicy) -> Result<(), ApiError> {
        self.with(|s| {
            s.log("set_project_policy");
            s.policy = policy.clone();
            Ok(())
        })
    }

    async fn set_workload_identity_binding(
        &self,
        sa_email: &str,
        cluster_service_account: &str,
    ) -> Result<(), ApiError> {
        self.with(|s| {
            s.log(format!("set_workload_identity_binding:{}", sa_email));
            s.workload_identity
                .push((sa_email.to_string(), cluster_service_account.to_string()));
            Ok(())
        })
    }
}
