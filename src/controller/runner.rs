//! Wiring of the reconcile loops into kube-runtime controllers
//!
//! Four controllers run side by side: one per managed kind and one for
//! Ingresses, which owns the derived ApiChecks. Every present ingress is
//! requeued on the sweep interval, and a background task deletes derived
//! checks whose ingress disappeared while the operator was not watching.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ListParams, PostParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, instrument, warn};

use super::derived::{DerivedResourceSynchronizer, SyncReport};
use super::reconcile_loop::{ObjectKey, ReconcileLoop};
use crate::annotations::{AnnotationScanner, IngressSource};
use crate::checkly::ChecklyApi;
use crate::config::OperatorConfig;
use crate::crd::{AlertChannel, ApiCheck, Group, ManagedResource};
use crate::error::{Error, Result};
use crate::mapper::{AlertChannelMapper, CheckMapper, GroupMapper, ResourceMapper};
use crate::store::{
    DependencySource, IngressStore, KubeDependencySource, KubeIngressStore, KubeStore,
    ResourceStore,
};

/// Requeue while another replica holds the lease
const STANDBY_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue after a derived check write lost a version race
const DERIVED_CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Shared state for the controllers and the HTTP server
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    /// Set once every controller has been started
    pub ready: Arc<AtomicBool>,
    /// False while another replica holds the lease
    pub is_leader: Arc<AtomicBool>,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig, is_leader: Arc<AtomicBool>) -> Self {
        Self {
            client,
            config,
            ready: Arc::new(AtomicBool::new(false)),
            is_leader,
        }
    }

    pub fn leading(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }
}

struct LoopContext<M: ResourceMapper> {
    reconcile_loop: ReconcileLoop<M>,
    state: Arc<ControllerState>,
}

struct IngressContext {
    synchronizer: DerivedResourceSynchronizer,
    ingresses: Arc<dyn IngressStore>,
    warnings: ReportedWarnings,
    state: Arc<ControllerState>,
}

/// A Warning Event raised on an ingress
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct IngressWarning {
    reason: &'static str,
    message: String,
}

impl IngressWarning {
    fn from_report(report: &SyncReport) -> BTreeSet<IngressWarning> {
        let mut warnings: BTreeSet<IngressWarning> = report
            .rejected
            .iter()
            .map(|rejected| IngressWarning {
                reason: "InvalidAnnotation",
                message: format!(
                    "rule {}: annotation {}: {}",
                    rejected.rule_key, rejected.annotation, rejected.message
                ),
            })
            .collect();
        if report.clashes > 0 {
            warnings.insert(IngressWarning {
                reason: "NameConflict",
                message: format!(
                    "{} derived ApiCheck names are taken by checks not owned by this ingress",
                    report.clashes
                ),
            });
        }
        warnings
    }
}

/// Warnings raised by the last pass over each ingress
///
/// The ingress controller also wakes up on every write to a derived check,
/// so only warnings the previous pass did not raise become Events.
#[derive(Default)]
struct ReportedWarnings {
    raised: Mutex<HashMap<ObjectKey, BTreeSet<IngressWarning>>>,
}

impl ReportedWarnings {
    fn fresh(&self, key: &ObjectKey, current: BTreeSet<IngressWarning>) -> Vec<IngressWarning> {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        let previous = raised.remove(key).unwrap_or_default();
        let fresh = current.difference(&previous).cloned().collect();
        if !current.is_empty() {
            raised.insert(key.clone(), current);
        }
        fresh
    }

    fn forget(&self, key: &ObjectKey) {
        self.raised
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Main entry point to start the controllers
pub async fn run_controllers(state: Arc<ControllerState>, api: Arc<dyn ChecklyApi>) -> Result<()> {
    let client = state.client.clone();
    let config = &state.config;

    verify_crd::<ApiCheck>(&client).await?;
    verify_crd::<Group>(&client).await?;
    verify_crd::<AlertChannel>(&client).await?;

    let dependencies: Arc<dyn DependencySource> =
        Arc::new(KubeDependencySource::new(client.clone()));
    let check_store: Arc<dyn ResourceStore<ApiCheck>> =
        Arc::new(KubeStore::<ApiCheck>::new(client.clone()));

    let checks = Arc::new(LoopContext {
        reconcile_loop: ReconcileLoop::<CheckMapper>::new(
            CheckMapper::new(config.default_locations.clone()),
            api.clone(),
            check_store.clone(),
            dependencies.clone(),
            config.loop_config(),
        ),
        state: state.clone(),
    });
    let groups = Arc::new(LoopContext {
        reconcile_loop: ReconcileLoop::<GroupMapper>::new(
            GroupMapper::new(config.default_locations.clone()),
            api.clone(),
            Arc::new(KubeStore::<Group>::new(client.clone())),
            dependencies.clone(),
            config.loop_config(),
        ),
        state: state.clone(),
    });
    let channels = Arc::new(LoopContext {
        reconcile_loop: ReconcileLoop::<AlertChannelMapper>::new(
            AlertChannelMapper,
            api,
            Arc::new(KubeStore::<AlertChannel>::new(client.clone())),
            dependencies,
            config.loop_config(),
        ),
        state: state.clone(),
    });
    let ingresses = Arc::new(IngressContext {
        synchronizer: DerivedResourceSynchronizer::new(
            AnnotationScanner::new(&config.controller_domain),
            check_store,
        ),
        ingresses: Arc::new(KubeIngressStore::new(client.clone())),
        warnings: ReportedWarnings::default(),
        state: state.clone(),
    });

    info!(
        "Starting controllers for domain {} with concurrency {}",
        config.controller_domain, config.concurrency
    );
    let controllers = futures::future::join4(
        run_loop(client.clone(), checks, config.concurrency),
        run_loop(client.clone(), groups, config.concurrency),
        run_loop(client.clone(), channels, config.concurrency),
        run_ingress_controller(
            client.clone(),
            ingresses.clone(),
            config.concurrency,
            config.sweep_interval(),
        ),
    );
    state.ready.store(true, Ordering::Relaxed);

    tokio::select! {
        _ = controllers => info!("Controllers stopped"),
        _ = run_sweep(ingresses, config.sweep_interval()) => {}
    }
    state.ready.store(false, Ordering::Relaxed);

    Ok(())
}

async fn verify_crd<K: ManagedResource>(client: &Client) -> Result<()> {
    let api: Api<K> = Api::all(client.clone());
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => {
            debug!("{} CRD is available", K::kind(&()));
            Ok(())
        }
        Err(e) => {
            error!(
                "{} CRD not found. Please install the CRDs first: {:?}",
                K::kind(&()),
                e
            );
            Err(Error::ConfigError(format!(
                "{} CRD not installed",
                K::kind(&())
            )))
        }
    }
}

async fn run_loop<M: ResourceMapper>(client: Client, ctx: Arc<LoopContext<M>>, concurrency: u16) {
    let kind = ctx.reconcile_loop.kind();
    let api: Api<M::Resource> = Api::all(client);

    Controller::new(api, Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile::<M>, error_policy::<M>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", kind, obj),
                Err(e) => debug!("{} reconcile error: {:?}", kind, e),
            }
        })
        .await;
}

async fn reconcile<M: ResourceMapper>(
    obj: Arc<M::Resource>,
    ctx: Arc<LoopContext<M>>,
) -> Result<Action> {
    if !ctx.state.leading() {
        return Ok(Action::requeue(STANDBY_REQUEUE));
    }

    let key = ObjectKey::of(obj.as_ref());
    let started = Instant::now();
    let result = ctx.reconcile_loop.reconcile(&key).await;

    #[cfg(feature = "metrics")]
    {
        let controller = ctx.reconcile_loop.kind().as_str();
        super::metrics::observe_reconcile_duration_seconds(
            controller,
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = &result {
            super::metrics::inc_reconcile_error(controller, e.reason());
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    result
}

fn error_policy<M: ResourceMapper>(
    obj: Arc<M::Resource>,
    error: &Error,
    ctx: Arc<LoopContext<M>>,
) -> Action {
    ctx.reconcile_loop
        .error_policy(&ObjectKey::of(obj.as_ref()), error)
}

async fn run_ingress_controller(
    client: Client,
    ctx: Arc<IngressContext>,
    concurrency: u16,
    resync: Duration,
) {
    let ingresses: Api<Ingress> = Api::all(client.clone());
    let resync = tokio::time::interval_at(tokio::time::Instant::now() + resync, resync);

    Controller::new(ingresses, Config::default())
        // Derived checks point back at their ingress
        .owns::<ApiCheck>(Api::all(client), Config::default())
        .reconcile_all_on(IntervalStream::new(resync).map(|_| ()))
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_ingress, ingress_error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled ingress {}", obj),
                Err(e) => debug!("Ingress reconcile error: {:?}", e),
            }
        })
        .await;
}

#[instrument(skip(ingress, ctx), fields(name = %ingress.name_any(), namespace = %ingress.namespace().unwrap_or_default()))]
async fn reconcile_ingress(ingress: Arc<Ingress>, ctx: Arc<IngressContext>) -> Result<Action> {
    if !ctx.state.leading() {
        return Ok(Action::requeue(STANDBY_REQUEUE));
    }

    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let key = ObjectKey::new(&namespace, &name);
    let api: Api<Ingress> = Api::namespaced(ctx.state.client.clone(), &namespace);

    // Deletion events hand us the last known object; decide from a fresh read
    let report = match api.get_opt(&name).await.map_err(Error::KubeError)? {
        Some(current) if current.metadata.deletion_timestamp.is_none() => {
            let report = ctx
                .synchronizer
                .sync_ingress(&IngressSource::from(&current))
                .await?;
            let warnings = IngressWarning::from_report(&report);
            for warning in ctx.warnings.fresh(&key, warnings) {
                if let Err(e) = emit_event(
                    &ctx.state.client,
                    &current,
                    "Warning",
                    warning.reason,
                    &warning.message,
                )
                .await
                {
                    warn!("Failed to emit event for ingress {}: {:?}", key, e);
                }
            }
            report
        }
        _ => {
            ctx.warnings.forget(&key);
            ctx.synchronizer.ingress_removed(&namespace, &name).await?
        }
    };

    if report.conflicts > 0 {
        debug!(
            "{} derived check writes conflicted for ingress {}/{}",
            report.conflicts, namespace, name
        );
        return Ok(Action::requeue(DERIVED_CONFLICT_REQUEUE));
    }
    Ok(Action::await_change())
}

fn ingress_error_policy(ingress: Arc<Ingress>, error: &Error, _ctx: Arc<IngressContext>) -> Action {
    error!(
        "Derived check sync failed for ingress {}: {:?}",
        ingress.name_any(),
        error
    );

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry_duration)
}

async fn run_sweep(ctx: Arc<IngressContext>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The controllers' initial listing covers the first pass
    interval.tick().await;

    loop {
        interval.tick().await;
        if !ctx.state.leading() {
            continue;
        }

        match ctx.synchronizer.sweep(ctx.ingresses.as_ref()).await {
            Ok(report) if report.deleted > 0 => info!(
                "Derived check sweep deleted {} checks of vanished ingresses",
                report.deleted
            ),
            Ok(_) => debug!("Derived check sweep found nothing to do"),
            Err(e) => warn!("Derived check sweep failed: {:?}", e),
        }
    }
}

/// Helper to emit a Kubernetes Event
async fn emit_event<K>(
    client: &Client,
    obj: &K,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", obj.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: obj.object_ref(&()),
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}
