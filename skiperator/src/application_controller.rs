use crate::{
    Configuration,
    backoff::Backoff,
    controllers::DependentResource,
    errors::ControllerError,
    ownership::bind_owner,
    registry::KindRegistry,
    status::StatusWriter,
    store::ObjectStore,
    synchronizer::{OperationResult, SyncPlan, Synchronizer},
    utils::{NamespacedName, dependent_labels, from_dynamic, metric_name},
};

use futures::StreamExt;
use kube::{Api, Client, ResourceExt, api::ApiResource};
use kube_runtime::{
    controller::{Action, Controller},
    watcher::Config,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use skiperator_apis::{Application, Phase};
use std::{future::Future, marker::PhantomData, sync::Arc, time::Instant};
use tokio::time::{Duration, sleep, timeout};

const APPLICATION_CONTROLLER: &'static str = "application_controller";

/// Reconciles the dependent resource `D` of every [`Application`].
///
/// One instance runs per dependent kind. Instances share nothing but the backing store and
/// the kind registry: each one only writes its own dependent object and its own entry in
/// the status of the Application.
pub(crate) struct ApplicationController<D: DependentResource> {
    configuration: Configuration,
    kinds: Arc<KindRegistry>,
    store: Arc<dyn ObjectStore>,
    /// The Application kind, resolved once from the kind registry.
    application: ApiResource,
    synchronizer: Synchronizer,
    status: StatusWriter,
    backoff: Backoff,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    _dependent: PhantomData<fn() -> D>,
}

impl<D: DependentResource> ApplicationController<D> {
    pub fn new(
        configuration: Configuration,
        kinds: Arc<KindRegistry>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ControllerError> {
        let application = kinds.api_resource::<Application>()?.clone();
        let meter: Meter = global::meter(APPLICATION_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of Application reconcile invocations per controller")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of Applications per controller in milliseconds")
            .with_unit("ms")
            .build();
        let backoff = Backoff::new(configuration.backoff_initial, configuration.backoff_max);
        Ok(Self {
            synchronizer: Synchronizer::new(store.clone()),
            status: StatusWriter::new(store.clone(), application.clone()),
            configuration,
            kinds,
            store,
            application,
            backoff,
            reconcile_count,
            reconcile_duration,
            _dependent: PhantomData,
        })
    }

    fn labels() -> [KeyValue; 1] {
        [KeyValue::new("controller", D::CONTROLLER.as_str())]
    }

    async fn load(&self, key: &NamespacedName) -> Result<Option<Application>, ControllerError> {
        match self.store.get(&self.application, key).await? {
            Some(object) => Ok(Some(from_dynamic(&object)?)),
            None => Ok(None),
        }
    }

    /// Compute the write converging the dependent object. Owner reference and labels are
    /// part of the desired state, so they are restored like any other field.
    async fn plan(
        &self,
        resource: &ApiResource,
        app: &Application,
        key: &NamespacedName,
    ) -> Result<SyncPlan, ControllerError> {
        self.synchronizer
            .plan::<D::Object, _>(resource, key, |object| {
                bind_owner(app, object)?;
                object.labels_mut().extend(dependent_labels(app));
                D::desired(app, object)
            })
            .await
    }

    async fn sync(&self, key: &NamespacedName) -> Result<Action, ControllerError> {
        let mut app = match self.load(key).await? {
            Some(app) => app,
            None => {
                debug!(
                    "{}: Application {} no longer exists, dependents are left to the garbage collector",
                    D::CONTROLLER,
                    key
                );
                return Ok(Action::await_change());
            }
        };
        let dependent = NamespacedName::new(key.namespace.as_str(), D::name(&app));
        let resource = match self.kinds.api_resource::<D::Object>() {
            Ok(resource) => resource,
            Err(e) => {
                self.status.mark_error(&mut app, D::CONTROLLER, &e).await;
                return Err(e);
            }
        };
        if !D::is_needed(&app) {
            trace!(
                "{}: Application {} has nothing to publish through {}",
                D::CONTROLLER,
                key,
                resource.kind
            );
            self.status
                .mark_outcome(&mut app, D::CONTROLLER, Phase::Synced, None)
                .await;
            return Ok(Action::requeue(self.configuration.resync_interval));
        }
        let plan = match self.plan(resource, &app, &dependent).await {
            Ok(plan) => plan,
            Err(e) => {
                self.status.mark_error(&mut app, D::CONTROLLER, &e).await;
                return Err(e);
            }
        };
        // Progressing is only recorded when a write follows. Every status write wakes all
        // controllers of the Application, so an idle reconcile must not write any.
        let result = if plan.is_unchanged() {
            Ok(OperationResult::Unchanged)
        } else {
            self.status.mark_progressing(&mut app, D::CONTROLLER).await;
            self.synchronizer.apply(resource, &dependent, plan).await
        };
        self.status
            .mark_outcome(&mut app, D::CONTROLLER, Phase::Synced, result.as_ref().err())
            .await;
        let result = result?;
        if result.changed() {
            info!(
                "{}: {} {} {} of Application {}",
                D::CONTROLLER,
                result,
                resource.kind,
                dependent,
                key
            );
        }
        Ok(Action::requeue(self.configuration.resync_interval))
    }

    /// Reconcile the dependent object of a single Application within the reconcile
    /// deadline.
    pub async fn reconcile_application(
        &self,
        key: &NamespacedName,
    ) -> Result<Action, ControllerError> {
        let start = Instant::now();
        let deadline = self.configuration.reconcile_timeout;
        let result = match timeout(deadline, self.sync(key)).await {
            Ok(result) => result,
            Err(_) => {
                let e = ControllerError::Timeout(format!(
                    "reconciliation did not finish within {}s",
                    deadline.as_secs_f32()
                ));
                // The reconciliation was cancelled, recording the error gets another deadline.
                let _ = timeout(deadline, async {
                    if let Ok(Some(mut app)) = self.load(key).await {
                        self.status.mark_error(&mut app, D::CONTROLLER, &e).await;
                    }
                })
                .await;
                Err(e)
            }
        };
        let labels = Self::labels();
        self.reconcile_count.add(1, &labels);
        self.reconcile_duration
            .record(start.elapsed().as_millis() as u64, &labels);
        if result.is_ok() {
            self.backoff.reset(key);
        }
        result
    }

    /// Controller triggers this whenever an Application or one of its dependents changed
    async fn reconcile(object: Arc<Application>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let key = NamespacedName::from(object.as_ref());
        if !ctx.configuration.is_watched(key.namespace.as_str()) {
            debug!(
                "Ignore {} as its namespace is not in the set of namespaces to watch",
                key
            );
            return Ok(Action::await_change());
        }
        ctx.reconcile_application(&key).await
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(object: Arc<Application>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        let key = NamespacedName::from(object.as_ref());
        let delay = ctx.backoff.next_delay(&key, error.is_temporary());
        debug!(
            "{}: retry {} in {}s after: {}",
            D::CONTROLLER,
            key,
            delay.as_secs(),
            error
        );
        Action::requeue(delay)
    }

    fn apis<K>(&self, client: &Client) -> Api<K>
    where
        K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        match self.configuration.single_watch_namespace() {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        }
    }

    pub fn start(self, client: Client) -> impl Future<Output = ()> + Send + 'static {
        let applications = self.apis::<Application>(&client);
        let dependents = self.apis::<D::Object>(&client);
        let meter: Meter = global::meter(APPLICATION_CONTROLLER);
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of Application reconcile errors per controller")
            .build();
        Controller::new(applications, Config::default())
            .owns(dependents, Config::default())
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(move |res| {
                let reconcile_errors = reconcile_errors.clone();
                async move {
                    let labels = Self::labels();
                    match res {
                        Ok(o) => {
                            debug!("{}: reconciled {}", D::CONTROLLER, o.0);
                        }
                        Err(e) => match e {
                            a @ kube_runtime::controller::Error::QueueError { .. } => {
                                debug!("{}: reconcile failed: {:?}", D::CONTROLLER, a);
                                reconcile_errors.add(1, &labels);
                                // Slow down on errors caused by missing CRDs or permissions.
                                sleep(Duration::from_secs(30)).await;
                            }
                            a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                                debug!("{}: reconcile failed: {:?}", D::CONTROLLER, a);
                            }
                            kube_runtime::controller::Error::ReconcilerFailed(e, o) => {
                                warn!("{}: reconcile of {} failed: {}", D::CONTROLLER, o, e);
                                reconcile_errors.add(1, &labels);
                            }
                            e => {
                                warn!("{}: reconcile failed: {:?}", D::CONTROLLER, e);
                                reconcile_errors.add(1, &labels);
                            }
                        },
                    }
                }
            })
    }
}
