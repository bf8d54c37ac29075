//! Controller wiring
//!
//! Builds the reconcile context from the adapter set, validates it, and
//! runs the kube-rs controller with the engine's reconcile/error-policy
//! pair. Up to five parents reconcile concurrently; reconciles of one
//! parent are serialized by the work queue.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client;
use tracing::{debug, error, info};

use xset_api::adapter::{ResourceContextAdapter, XSetController};
use xset_api::events::{EventPublisher, KubeEventPublisher};
use xset_api::labels::LabelKey;
use xset_api::validation::{validate_resource_context_adapter, validate_xset_controller};
use xset_api::{Error, Result};

use crate::expectations::{CacheExpectations, CacheReader, KubeCacheReader};
use crate::reconciler::{error_policy, reconcile, KubeXSetClient, XSetClient, XSetContext};
use crate::resource_context::{
    KubeResourceContextClient, ResourceContextClient, ResourceContextControl,
};
use crate::revision::RevisionManager;
use crate::subresources::PvcControl;
use crate::sync::SyncControl;
use crate::targets::{KubeTargetControl, TargetControl};

/// Parents reconciled in parallel per controller
pub const MAX_CONCURRENT_RECONCILES: u16 = 5;

impl<C: XSetController, RA: ResourceContextAdapter> XSetContext<C, RA> {
    /// Start building a context for the given adapter pair
    pub fn builder(controller: C, adapter: RA) -> XSetContextBuilder<C, RA> {
        XSetContextBuilder::new(controller, adapter)
    }
}

/// Builder for [`XSetContext`]
///
/// Sync control and the revision manager are always supplied by the
/// concrete controller. Everything else defaults to a kube-backed
/// implementation when a client is provided, and may be overridden
/// individually (primarily for tests).
pub struct XSetContextBuilder<C: XSetController, RA: ResourceContextAdapter> {
    controller: Arc<C>,
    adapter: Arc<RA>,
    client: Option<Client>,
    sync_control: Option<Arc<dyn SyncControl<C>>>,
    revision_manager: Option<Arc<dyn RevisionManager<C>>>,
    xset_client: Option<Arc<dyn XSetClient<C>>>,
    target_control: Option<Arc<dyn TargetControl<C>>>,
    resource_context_client: Option<Arc<dyn ResourceContextClient<RA::ResourceContext>>>,
    cache_reader: Option<Arc<dyn CacheReader>>,
    events: Option<Arc<dyn EventPublisher>>,
    pvc_control: Option<Arc<dyn PvcControl<C>>>,
    expectations: Option<Arc<CacheExpectations>>,
}

impl<C: XSetController, RA: ResourceContextAdapter> XSetContextBuilder<C, RA> {
    fn new(controller: C, adapter: RA) -> Self {
        Self {
            controller: Arc::new(controller),
            adapter: Arc::new(adapter),
            client: None,
            sync_control: None,
            revision_manager: None,
            xset_client: None,
            target_control: None,
            resource_context_client: None,
            cache_reader: None,
            events: None,
            pvc_control: None,
            expectations: None,
        }
    }

    /// Kubernetes client backing every non-overridden collaborator
    pub fn kube_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// The scale/replace/update policy (required)
    pub fn sync_control(mut self, sync_control: Arc<dyn SyncControl<C>>) -> Self {
        self.sync_control = Some(sync_control);
        self
    }

    /// The revision-history helper (required)
    pub fn revision_manager(mut self, revision_manager: Arc<dyn RevisionManager<C>>) -> Self {
        self.revision_manager = Some(revision_manager);
        self
    }

    /// Override the parent client (primarily for testing)
    pub fn xset_client(mut self, client: Arc<dyn XSetClient<C>>) -> Self {
        self.xset_client = Some(client);
        self
    }

    /// Override the target client (primarily for testing)
    pub fn target_control(mut self, target_control: Arc<dyn TargetControl<C>>) -> Self {
        self.target_control = Some(target_control);
        self
    }

    /// Override the sidecar client (primarily for testing)
    pub fn resource_context_client(
        mut self,
        client: Arc<dyn ResourceContextClient<RA::ResourceContext>>,
    ) -> Self {
        self.resource_context_client = Some(client);
        self
    }

    /// Override the cache reader (primarily for testing)
    pub fn cache_reader(mut self, reader: Arc<dyn CacheReader>) -> Self {
        self.cache_reader = Some(reader);
        self
    }

    /// Override the event publisher (primarily for testing)
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Enable the PVC sub-resource capability
    pub fn pvc_control(mut self, pvc_control: Arc<dyn PvcControl<C>>) -> Self {
        self.pvc_control = Some(pvc_control);
        self
    }

    /// Share an expectation table with other components
    pub fn expectations(mut self, expectations: Arc<CacheExpectations>) -> Self {
        self.expectations = Some(expectations);
        self
    }

    /// Validate the adapters and assemble the context
    ///
    /// Fails with a non-retryable validation error when the adapter
    /// surface is incomplete; the controller must not start.
    pub fn build(self) -> Result<Arc<XSetContext<C, RA>>> {
        validate_xset_controller(self.controller.as_ref())?;
        validate_resource_context_adapter(self.adapter.as_ref())?;

        let name = self.controller.controller_name().to_string();
        let missing = |component: &str| {
            Error::validation_for(&name, format!("{component} is required"))
        };
        let unbacked = |component: &str| {
            Error::validation_for(
                &name,
                format!("{component} requires a kube client or an explicit override"),
            )
        };

        let sync_control = self.sync_control.ok_or_else(|| missing("sync control"))?;
        let revision_manager = self
            .revision_manager
            .ok_or_else(|| missing("revision manager"))?;

        let client = self.client;
        let xset_client: Arc<dyn XSetClient<C>> = match (self.xset_client, &client) {
            (Some(override_), _) => override_,
            (None, Some(client)) => Arc::new(KubeXSetClient::new(client.clone())),
            (None, None) => return Err(unbacked("xset client")),
        };
        let target_control: Arc<dyn TargetControl<C>> = match (self.target_control, &client) {
            (Some(override_), _) => override_,
            (None, Some(client)) => Arc::new(KubeTargetControl::new(client.clone())),
            (None, None) => return Err(unbacked("target control")),
        };
        let resource_context_client: Arc<dyn ResourceContextClient<RA::ResourceContext>> =
            match (self.resource_context_client, &client) {
                (Some(override_), _) => override_,
                (None, Some(client)) => Arc::new(KubeResourceContextClient::new(client.clone())),
                (None, None) => return Err(unbacked("resource context client")),
            };
        let cache_reader: Arc<dyn CacheReader> = match (self.cache_reader, &client) {
            (Some(override_), _) => override_,
            (None, Some(client)) => Arc::new(KubeCacheReader::new(client.clone())),
            (None, None) => return Err(unbacked("cache reader")),
        };
        let events: Arc<dyn EventPublisher> = match (self.events, &client) {
            (Some(override_), _) => override_,
            (None, Some(client)) => Arc::new(KubeEventPublisher::new(client.clone(), &name)),
            (None, None) => return Err(unbacked("event publisher")),
        };

        let expectations = self
            .expectations
            .unwrap_or_else(|| Arc::new(CacheExpectations::new()));

        let resource_contexts = Arc::new(ResourceContextControl::new(
            self.controller.clone(),
            self.adapter.clone(),
            resource_context_client,
            events.clone(),
            expectations.clone(),
        ));

        Ok(Arc::new(XSetContext {
            controller: self.controller,
            client: xset_client,
            target_control,
            sync_control,
            revision_manager,
            resource_contexts,
            pvc_control: self.pvc_control,
            expectations,
            cache_reader,
            events,
        }))
    }
}

/// Run the controller until shutdown
///
/// Watches the parent type, owns the target type filtered to
/// engine-labeled objects, and attaches the decoration watch when the
/// adapter provides one.
pub async fn run_controller<C, RA>(client: Client, ctx: Arc<XSetContext<C, RA>>)
where
    C: XSetController,
    RA: ResourceContextAdapter,
{
    let parents: Api<C::XSet> = Api::all(client.clone());
    let targets: Api<C::Target> = Api::all(client);

    let labels = ctx.controller.label_manager();
    let controlled_by = labels.value(LabelKey::ControlledBy).to_string();

    info!(
        controller = ctx.controller.controller_name(),
        "starting xset controller"
    );

    let mut controller = Controller::new(parents, WatcherConfig::default())
        .owns(targets, WatcherConfig::default().labels(&controlled_by))
        .with_config(ControllerConfig::default().concurrency(MAX_CONCURRENT_RECONCILES));

    if let Some(decoration) = ctx.controller.decoration_adapter() {
        controller = decoration.attach_watch(controller);
    }

    controller
        .shutdown_on_signal()
        .run(reconcile::<C, RA>, error_policy::<C, RA>, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "reconciliation completed"),
                Err(e) => error!(error = ?e, "reconciliation error"),
            }
        })
        .await;
}
