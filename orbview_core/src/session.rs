//! Per-View Session Context
//!
//! `ViewContext` is the explicitly owned root object of one render session.
//! It replaces two patterns the original design suffered from:
//! - a shared singleton service mutated by every open view (here each view
//!   instantiates its own context and passes handles to collaborators)
//! - a wildcard "observe any property" callback (here edits dispatch a
//!   typed [`ConfigEvent`] carrying the concrete field diff over a channel)
//!
//! The context owns the track store, clock synchronizer, ingest pipeline,
//! sensor table and camera directive, and exposes the entity/sensor
//! lifecycle operations the host drives. Teardown is synchronous: once it
//! returns, no event, sample, or offload result has any effect.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use uuid::Uuid;

use crate::ingest::{IngestPipeline, IngestStats, RawSample};
use crate::orbview_clock::{ClockBounds, ClockConfig, ClockMode, ClockSync, TimeAuthorityEvent};
use crate::orbview_geometry::{
    footprint, sensor_pose, ConfigError, EntityId, Footprint, SensorDefinition, SensorId,
    SensorPose,
};
use crate::orbview_track::{
    ExtrapolationPolicy, PoseQuery, SampleOutcome, TrackConfig, TrackStore,
};

// ============================================================================
// HOST SEAMS
// ============================================================================

/// History fetch failed. Non-fatal: the entity stays "not yet available"
/// until live telemetry arrives.
#[derive(Debug, Clone, thiserror::Error)]
#[error("history fetch failed: {0}")]
pub struct FetchError(pub String);

/// Bulk history source. Expected to be called off the per-frame path
/// (pre-fetch); the context never calls it from a query.
pub trait HistoryProvider {
    fn request_history(
        &self,
        entity: EntityId,
        range: (f64, f64),
    ) -> Result<Vec<RawSample>, FetchError>;
}

/// Host-side capability registration (domain types, views, actions).
///
/// The context only announces entities; what registration means is entirely
/// the host's business.
pub trait CapabilityRegistry {
    fn register(&mut self, entity: EntityId);
    fn unregister(&mut self, entity: EntityId);
}

/// Live telemetry subscription handle. Dropping it detaches the
/// subscription; the detach action runs exactly once.
pub struct LiveHandle(Option<Box<dyn FnOnce()>>);

impl LiveHandle {
    pub fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(unsubscribe)))
    }

    /// Handle for sources with no explicit detach action.
    pub fn detached() -> Self {
        Self(None)
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}

/// Push-feed source for live telemetry. The context subscribes each entity
/// on creation and holds the handle, so at most one subscription per entity
/// is ever active; destroying the entity or tearing the session down drops
/// the handle synchronously. Delivery itself stays host-driven: the
/// source's callback forwards samples into [`ViewContext::push_live`].
pub trait LiveSource {
    fn subscribe(&mut self, entity: EntityId) -> LiveHandle;
}

// ============================================================================
// CONFIGURATION & EVENTS
// ============================================================================

/// Session-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub track: TrackConfig,
    pub clock: ClockConfig,
    /// Spawn the offload normalization worker for bulk history
    pub offload: bool,
}

/// Per-entity display configuration owned by the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityConfig {
    pub name: String,
    /// Overrides the store default when set
    pub policy: Option<ExtrapolationPolicy>,
}

/// Field diff for an entity edit; `None` fields were untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub name: Option<String>,
    pub policy: Option<ExtrapolationPolicy>,
}

/// Field diff for a sensor edit; `None` fields were untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorPatch {
    pub local_axis: Option<crate::orbview_geometry::SensorAxis>,
    pub fov_degrees: Option<f64>,
    pub range_meters: Option<f64>,
    pub color: Option<[f32; 4]>,
    pub shape: Option<crate::orbview_geometry::ShapeKind>,
    pub aspect_ratio: Option<f64>,
}

impl SensorPatch {
    fn apply(&self, base: &SensorDefinition) -> SensorDefinition {
        SensorDefinition {
            parent: base.parent,
            local_axis: self.local_axis.unwrap_or(base.local_axis),
            fov_degrees: self.fov_degrees.unwrap_or(base.fov_degrees),
            range_meters: self.range_meters.unwrap_or(base.range_meters),
            color: self.color.unwrap_or(base.color),
            shape: self.shape.unwrap_or(base.shape),
            aspect_ratio: self.aspect_ratio.unwrap_or(base.aspect_ratio),
        }
    }
}

/// Typed configuration-change notifications, one per concrete edit.
///
/// Published on an unbounded channel with single-consumer semantics (the
/// renderer's invalidation feed).
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    EntityAdded { entity: EntityId },
    EntityUpdated { entity: EntityId, diff: EntityPatch },
    EntityRemoved { entity: EntityId },
    SensorAdded { entity: EntityId, sensor: SensorId },
    /// A sensor edit always rebuilds the derived geometry whole; the
    /// generation lets the renderer drop cached primitives cheaply
    SensorRebuilt {
        entity: EntityId,
        sensor: SensorId,
        generation: u64,
        diff: SensorPatch,
    },
    SensorRemoved { entity: EntityId, sensor: SensorId },
    TornDown,
}

// ============================================================================
// CAMERA
// ============================================================================

/// Camera control state consumed by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraDirective {
    Free,
    /// Camera locked onto an entity until reset or another directive
    Locked(EntityId),
}

// ============================================================================
// SENSOR TABLE
// ============================================================================

#[derive(Debug, Clone)]
struct SensorEntry {
    definition: SensorDefinition,
    /// Bumped on every rebuild (edits are remove-then-recreate)
    generation: u64,
}

// ============================================================================
// VIEW CONTEXT
// ============================================================================

/// Root object of one render session. One per open view; never shared.
pub struct ViewContext {
    store: TrackStore,
    clock: ClockSync,
    ingest: IngestPipeline,

    entities: HashMap<EntityId, EntityConfig>,
    sensors: HashMap<SensorId, SensorEntry>,

    camera: CameraDirective,
    pending_fly_to: Option<EntityId>,

    events_tx: Sender<ConfigEvent>,
    events_rx: Receiver<ConfigEvent>,

    registry: Option<Box<dyn CapabilityRegistry>>,
    live_source: Option<Box<dyn LiveSource>>,
    live_handles: HashMap<EntityId, LiveHandle>,
    torn_down: bool,
}

impl ViewContext {
    pub fn new(config: SessionConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        let ingest = if config.offload {
            IngestPipeline::with_offload()
        } else {
            IngestPipeline::new()
        };

        Self {
            store: TrackStore::new(config.track),
            clock: ClockSync::new(
                config.clock,
                ClockMode::Realtime,
                ClockBounds { start: 0.0, end: 0.0 },
            ),
            ingest,
            entities: HashMap::new(),
            sensors: HashMap::new(),
            camera: CameraDirective::Free,
            pending_fly_to: None,
            events_tx,
            events_rx,
            registry: None,
            live_source: None,
            live_handles: HashMap::new(),
            torn_down: false,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SessionConfig::default())
    }

    /// Attach the host's capability registry.
    pub fn set_registry(&mut self, registry: Box<dyn CapabilityRegistry>) {
        self.registry = Some(registry);
    }

    /// Attach the host's live feed. Entities already in the session are
    /// subscribed immediately; inserting over an old handle drops it, so no
    /// entity ever holds two subscriptions.
    pub fn set_live_source(&mut self, mut source: Box<dyn LiveSource>) {
        for entity in self.entities.keys() {
            self.live_handles.insert(*entity, source.subscribe(*entity));
        }
        self.live_source = Some(source);
    }

    /// Invalidation feed for the renderer. Single consumer: cloning the
    /// receiver splits the stream, it does not broadcast.
    pub fn subscribe(&self) -> Receiver<ConfigEvent> {
        self.events_rx.clone()
    }

    fn emit(&self, event: ConfigEvent) {
        // Receiver lives in self, so the channel cannot be disconnected
        let _ = self.events_tx.send(event);
    }

    // ========================================================================
    // ENTITY LIFECYCLE
    // ========================================================================

    /// Add an entity: create its track, pull bulk history over the current
    /// clock bounds, and announce it to the capability registry.
    ///
    /// A failed or empty history fetch is non-fatal; the entity simply
    /// stays "not yet available" until live samples arrive.
    pub fn add_entity(
        &mut self,
        entity: EntityId,
        config: EntityConfig,
        provider: &dyn HistoryProvider,
    ) -> Result<(), ConfigError> {
        if self.torn_down {
            return Err(ConfigError::TornDown);
        }
        self.store
            .create_track(entity)
            .map_err(|_| ConfigError::DuplicateEntity(entity))?;
        if let Some(policy) = config.policy {
            let _ = self.store.set_policy(entity, policy);
        }
        self.entities.insert(entity, config);

        let bounds = self.clock.bounds();
        match provider.request_history(entity, (bounds.start, bounds.end)) {
            Ok(samples) => {
                self.ingest.ingest_history(&mut self.store, entity, samples);
            }
            Err(e) => {
                log::warn!("history for entity {entity} unavailable: {e}");
            }
        }

        if let Some(registry) = self.registry.as_mut() {
            registry.register(entity);
        }
        if let Some(source) = self.live_source.as_mut() {
            self.live_handles.insert(entity, source.subscribe(entity));
        }
        self.emit(ConfigEvent::EntityAdded { entity });
        Ok(())
    }

    /// Apply an entity edit and publish the diff.
    pub fn update_entity_config(
        &mut self,
        entity: EntityId,
        patch: EntityPatch,
    ) -> Result<(), ConfigError> {
        let config = self
            .entities
            .get_mut(&entity)
            .ok_or(ConfigError::UnknownEntity(entity))?;

        if let Some(name) = &patch.name {
            config.name = name.clone();
        }
        if let Some(policy) = patch.policy {
            config.policy = Some(policy);
            let _ = self.store.set_policy(entity, policy);
        }

        self.emit(ConfigEvent::EntityUpdated { entity, diff: patch });
        Ok(())
    }

    /// Destroy the entity: its track, its sensors, its registrations. Late
    /// offload results and live samples for it are dropped from here on.
    pub fn remove_entity(&mut self, entity: EntityId) -> bool {
        if self.entities.remove(&entity).is_none() {
            return false;
        }
        // Detach the live subscription before the track goes away
        self.live_handles.remove(&entity);
        self.store.remove_track(entity);

        let orphaned: Vec<SensorId> = self
            .sensors
            .iter()
            .filter(|(_, e)| e.definition.parent == entity)
            .map(|(id, _)| *id)
            .collect();
        for sensor in orphaned {
            self.sensors.remove(&sensor);
            self.emit(ConfigEvent::SensorRemoved { entity, sensor });
        }

        if self.camera == CameraDirective::Locked(entity) {
            self.camera = CameraDirective::Free;
        }
        if self.pending_fly_to == Some(entity) {
            self.pending_fly_to = None;
        }

        if let Some(registry) = self.registry.as_mut() {
            registry.unregister(entity);
        }
        self.emit(ConfigEvent::EntityRemoved { entity });
        true
    }

    pub fn has_entity(&self, entity: EntityId) -> bool {
        self.entities.contains_key(&entity)
    }

    pub fn entity_config(&self, entity: EntityId) -> Option<&EntityConfig> {
        self.entities.get(&entity)
    }

    // ========================================================================
    // TELEMETRY
    // ========================================================================

    /// Push one live sample from the host's subscription callback.
    pub fn push_live(&mut self, entity: EntityId, raw: &RawSample) -> Option<SampleOutcome> {
        if self.torn_down {
            return None;
        }
        self.ingest
            .ingest_live(&mut self.store, &mut self.clock, entity, raw)
    }

    /// Forward one time-authority event to the clock synchronizer.
    pub fn handle_time_event(&mut self, event: TimeAuthorityEvent) {
        self.clock.handle_event(event);
    }

    /// Per-frame entry point: apply finished offload batches and hand back
    /// the render clock time. Nothing here blocks.
    pub fn begin_frame(&mut self) -> Option<f64> {
        if self.torn_down {
            return None;
        }
        self.ingest.pump(&mut self.store);
        self.clock.render_time()
    }

    /// Pose of an entity at render time `t`.
    pub fn query_pose(&self, entity: EntityId, t: f64) -> PoseQuery {
        self.store
            .query(entity, t)
            .unwrap_or(PoseQuery::NotYetAvailable)
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.ingest.stats()
    }

    pub fn store(&self) -> &TrackStore {
        &self.store
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    // ========================================================================
    // SENSORS
    // ========================================================================

    /// Attach a sensor to an entity. Validation failures surface
    /// synchronously and nothing is stored.
    pub fn add_sensor(
        &mut self,
        entity: EntityId,
        definition: SensorDefinition,
    ) -> Result<SensorId, ConfigError> {
        if !self.entities.contains_key(&entity) {
            return Err(ConfigError::UnknownEntity(entity));
        }
        definition.validate()?;

        let mut definition = definition;
        definition.parent = entity;
        let sensor = Uuid::new_v4();
        self.sensors.insert(
            sensor,
            SensorEntry {
                definition,
                generation: 0,
            },
        );
        self.emit(ConfigEvent::SensorAdded { entity, sensor });
        Ok(sensor)
    }

    /// Edit a sensor. The derived geometry is rebuilt whole (new
    /// generation); a rejected edit leaves the last valid definition and
    /// its geometry untouched.
    pub fn update_sensor(
        &mut self,
        sensor: SensorId,
        patch: SensorPatch,
    ) -> Result<u64, ConfigError> {
        let entry = self
            .sensors
            .get_mut(&sensor)
            .ok_or(ConfigError::UnknownSensor(sensor))?;

        let candidate = patch.apply(&entry.definition);
        candidate.validate()?;

        entry.definition = candidate;
        entry.generation += 1;
        let generation = entry.generation;
        let entity = entry.definition.parent;

        self.emit(ConfigEvent::SensorRebuilt {
            entity,
            sensor,
            generation,
            diff: patch,
        });
        Ok(generation)
    }

    pub fn remove_sensor(&mut self, entity: EntityId, sensor: SensorId) -> bool {
        match self.sensors.get(&sensor) {
            Some(entry) if entry.definition.parent == entity => {
                self.sensors.remove(&sensor);
                self.emit(ConfigEvent::SensorRemoved { entity, sensor });
                true
            }
            _ => false,
        }
    }

    pub fn sensor(&self, sensor: SensorId) -> Option<&SensorDefinition> {
        self.sensors.get(&sensor).map(|e| &e.definition)
    }

    pub fn sensor_generation(&self, sensor: SensorId) -> Option<u64> {
        self.sensors.get(&sensor).map(|e| e.generation)
    }

    pub fn sensors_for(&self, entity: EntityId) -> Vec<SensorId> {
        self.sensors
            .iter()
            .filter(|(_, e)| e.definition.parent == entity)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Derived volume pose for one sensor at render time `t`. `Ok(None)`
    /// while the parent has no pose yet.
    pub fn sensor_pose_at(
        &self,
        sensor: SensorId,
        t: f64,
    ) -> Result<Option<SensorPose>, ConfigError> {
        let entry = self
            .sensors
            .get(&sensor)
            .ok_or(ConfigError::UnknownSensor(sensor))?;
        let parent = entry.definition.parent;
        match self.query_pose(parent, t) {
            PoseQuery::Pose(pose) => Ok(Some(sensor_pose(&pose, &entry.definition))),
            PoseQuery::NotYetAvailable => Ok(None),
        }
    }

    /// Boresight footprint for one sensor at render time `t`. Hidden while
    /// the parent has no pose or the ray misses the body.
    pub fn sensor_footprint_at(
        &self,
        sensor: SensorId,
        t: f64,
    ) -> Result<Footprint, ConfigError> {
        let entry = self
            .sensors
            .get(&sensor)
            .ok_or(ConfigError::UnknownSensor(sensor))?;
        let parent = entry.definition.parent;
        match self.query_pose(parent, t) {
            PoseQuery::Pose(pose) => Ok(footprint(&pose, &entry.definition)),
            PoseQuery::NotYetAvailable => Ok(Footprint::Hidden),
        }
    }

    // ========================================================================
    // CAMERA
    // ========================================================================

    /// Lock the camera onto an entity.
    pub fn track_camera(&mut self, entity: EntityId) -> Result<(), ConfigError> {
        if !self.entities.contains_key(&entity) {
            return Err(ConfigError::UnknownEntity(entity));
        }
        self.camera = CameraDirective::Locked(entity);
        Ok(())
    }

    /// One-shot fly-to; releases any existing lock.
    pub fn fly_to_camera(&mut self, entity: EntityId) -> Result<(), ConfigError> {
        if !self.entities.contains_key(&entity) {
            return Err(ConfigError::UnknownEntity(entity));
        }
        self.camera = CameraDirective::Free;
        self.pending_fly_to = Some(entity);
        Ok(())
    }

    pub fn reset_camera(&mut self) {
        self.camera = CameraDirective::Free;
        self.pending_fly_to = None;
    }

    pub fn camera(&self) -> CameraDirective {
        self.camera
    }

    /// Consume the pending fly-to, if any. The renderer calls this once per
    /// frame; the directive fires exactly once.
    pub fn take_fly_to(&mut self) -> Option<EntityId> {
        self.pending_fly_to.take()
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Release every track, sensor, listener and the offload channel.
    /// Synchronous: once this returns nothing fires.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        // Live subscriptions detach first so no push lands mid-teardown
        self.live_handles.clear();
        self.live_source = None;
        if let Some(registry) = self.registry.as_mut() {
            for entity in self.entities.keys() {
                registry.unregister(*entity);
            }
        }
        for entity in self.entities.keys() {
            self.store.remove_track(*entity);
        }
        self.entities.clear();
        self.sensors.clear();
        self.camera = CameraDirective::Free;
        self.pending_fly_to = None;
        self.ingest.teardown();
        self.clock.teardown();
        self.emit(ConfigEvent::TornDown);
        self.torn_down = true;
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for ViewContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orbview_geometry::{SensorAxis, ShapeKind};
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct StubProvider {
        samples: Vec<RawSample>,
        fail: bool,
    }

    impl HistoryProvider for StubProvider {
        fn request_history(
            &self,
            _entity: EntityId,
            _range: (f64, f64),
        ) -> Result<Vec<RawSample>, FetchError> {
            if self.fail {
                Err(FetchError("upstream 503".into()))
            } else {
                Ok(self.samples.clone())
            }
        }
    }

    fn raw(t: f64, lat: f64) -> RawSample {
        RawSample {
            t,
            lat_deg: lat,
            lon_deg: 0.0,
            alt_m: 500_000.0,
            quaternion: None,
            euler_deg: None,
        }
    }

    fn sensor_def(parent: EntityId) -> SensorDefinition {
        SensorDefinition {
            parent,
            local_axis: SensorAxis::PlusZ,
            fov_degrees: 15.0,
            range_meters: 1_000.0,
            color: [0.0, 1.0, 0.0, 0.3],
            shape: ShapeKind::Cone,
            aspect_ratio: 1.0,
        }
    }

    fn context_with_entity(provider: &StubProvider) -> (ViewContext, EntityId) {
        let mut ctx = ViewContext::with_defaults();
        let entity = Uuid::new_v4();
        ctx.add_entity(entity, EntityConfig::default(), provider)
            .unwrap();
        (ctx, entity)
    }

    #[test]
    fn test_add_entity_loads_history() {
        let provider = StubProvider {
            samples: vec![raw(60.0, 1.0), raw(0.0, 0.0)],
            fail: false,
        };
        let (ctx, entity) = context_with_entity(&provider);

        assert!(ctx.has_entity(entity));
        assert!(ctx.query_pose(entity, 30.0).pose().is_some());
    }

    #[test]
    fn test_fetch_failure_degrades_to_not_yet_available() {
        let provider = StubProvider {
            samples: vec![],
            fail: true,
        };
        let (ctx, entity) = context_with_entity(&provider);

        assert!(ctx.has_entity(entity));
        assert_eq!(ctx.query_pose(entity, 0.0), PoseQuery::NotYetAvailable);
    }

    #[test]
    fn test_push_live_advances_render_clock() {
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);

        ctx.push_live(entity, &raw(100.0, 0.0));
        let t = ctx.begin_frame().unwrap();
        assert_relative_eq!(t, 100.0 - ctx.clock().lag_buffer());
    }

    #[test]
    fn test_add_sensor_validates_synchronously() {
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);

        let mut bad = sensor_def(entity);
        bad.range_meters = -1.0;
        assert!(matches!(
            ctx.add_sensor(entity, bad),
            Err(ConfigError::NonPositiveRange(_))
        ));
        assert!(ctx.sensors_for(entity).is_empty());

        let sensor = ctx.add_sensor(entity, sensor_def(entity)).unwrap();
        assert_eq!(ctx.sensor_generation(sensor), Some(0));
    }

    #[test]
    fn test_rejected_edit_keeps_last_valid_geometry() {
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);
        let sensor = ctx.add_sensor(entity, sensor_def(entity)).unwrap();

        let err = ctx.update_sensor(
            sensor,
            SensorPatch {
                fov_degrees: Some(270.0),
                ..SensorPatch::default()
            },
        );
        assert!(matches!(err, Err(ConfigError::InvalidFov(_))));

        // Definition and generation untouched
        assert_relative_eq!(ctx.sensor(sensor).unwrap().fov_degrees, 15.0);
        assert_eq!(ctx.sensor_generation(sensor), Some(0));
    }

    #[test]
    fn test_valid_edit_rebuilds_with_new_generation() {
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);
        let sensor = ctx.add_sensor(entity, sensor_def(entity)).unwrap();
        let events = ctx.subscribe();
        while events.try_recv().is_ok() {}

        let generation = ctx
            .update_sensor(
                sensor,
                SensorPatch {
                    range_meters: Some(2_000.0),
                    ..SensorPatch::default()
                },
            )
            .unwrap();
        assert_eq!(generation, 1);
        assert_relative_eq!(ctx.sensor(sensor).unwrap().range_meters, 2_000.0);

        match events.try_recv() {
            Ok(ConfigEvent::SensorRebuilt {
                generation, diff, ..
            }) => {
                assert_eq!(generation, 1);
                assert_eq!(diff.range_meters, Some(2_000.0));
                assert_eq!(diff.fov_degrees, None);
            }
            other => panic!("expected SensorRebuilt, got {other:?}"),
        }
    }

    #[test]
    fn test_sensor_pose_and_footprint_through_context() {
        let provider = StubProvider {
            samples: vec![raw(0.0, 0.0), raw(60.0, 0.0)],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);
        let mut def = sensor_def(entity);
        def.local_axis = SensorAxis::MinusZ;
        let sensor = ctx.add_sensor(entity, def).unwrap();

        let pose = ctx.sensor_pose_at(sensor, 30.0).unwrap();
        assert!(pose.is_some());
        // Footprint may or may not hit depending on attitude; must never error
        assert!(ctx.sensor_footprint_at(sensor, 30.0).is_ok());
    }

    #[test]
    fn test_sensor_pose_before_first_sample_is_none() {
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);
        let sensor = ctx.add_sensor(entity, sensor_def(entity)).unwrap();

        assert_eq!(ctx.sensor_pose_at(sensor, 0.0).unwrap(), None);
        assert_eq!(
            ctx.sensor_footprint_at(sensor, 0.0).unwrap(),
            Footprint::Hidden
        );
    }

    #[test]
    fn test_remove_entity_removes_sensors_and_camera_lock() {
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);
        let sensor = ctx.add_sensor(entity, sensor_def(entity)).unwrap();
        ctx.track_camera(entity).unwrap();

        assert!(ctx.remove_entity(entity));
        assert!(ctx.sensor(sensor).is_none());
        assert_eq!(ctx.camera(), CameraDirective::Free);
        assert!(!ctx.remove_entity(entity));

        // Late live sample for the destroyed entity: silently dropped
        assert_eq!(ctx.push_live(entity, &raw(10.0, 0.0)), None);
        assert_eq!(ctx.ingest_stats().orphaned_dropped, 1);
    }

    #[test]
    fn test_fly_to_is_one_shot_and_releases_lock() {
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);

        ctx.track_camera(entity).unwrap();
        assert_eq!(ctx.camera(), CameraDirective::Locked(entity));

        ctx.fly_to_camera(entity).unwrap();
        assert_eq!(ctx.camera(), CameraDirective::Free);
        assert_eq!(ctx.take_fly_to(), Some(entity));
        assert_eq!(ctx.take_fly_to(), None);
    }

    #[test]
    fn test_config_events_carry_diffs() {
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);
        let events = ctx.subscribe();
        while events.try_recv().is_ok() {}

        ctx.update_entity_config(
            entity,
            EntityPatch {
                name: Some("ISS".into()),
                policy: None,
            },
        )
        .unwrap();

        match events.try_recv() {
            Ok(ConfigEvent::EntityUpdated { diff, .. }) => {
                assert_eq!(diff.name.as_deref(), Some("ISS"));
                assert_eq!(diff.policy, None);
            }
            other => panic!("expected EntityUpdated, got {other:?}"),
        }
    }

    #[test]
    fn test_registry_sees_lifecycle() {
        #[derive(Default)]
        struct Recorder {
            registered: Vec<EntityId>,
            unregistered: Vec<EntityId>,
        }
        struct SharedRegistry(Rc<RefCell<Recorder>>);
        impl CapabilityRegistry for SharedRegistry {
            fn register(&mut self, entity: EntityId) {
                self.0.borrow_mut().registered.push(entity);
            }
            fn unregister(&mut self, entity: EntityId) {
                self.0.borrow_mut().unregistered.push(entity);
            }
        }

        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut ctx = ViewContext::with_defaults();
        ctx.set_registry(Box::new(SharedRegistry(recorder.clone())));

        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };
        let entity = Uuid::new_v4();
        ctx.add_entity(entity, EntityConfig::default(), &provider)
            .unwrap();
        ctx.remove_entity(entity);

        assert_eq!(recorder.borrow().registered, vec![entity]);
        assert_eq!(recorder.borrow().unregistered, vec![entity]);
    }

    #[test]
    fn test_live_source_subscription_lifecycle() {
        #[derive(Default)]
        struct FeedLog {
            subscribed: Vec<EntityId>,
            unsubscribed: Vec<EntityId>,
        }
        struct SharedFeed(Rc<RefCell<FeedLog>>);
        impl LiveSource for SharedFeed {
            fn subscribe(&mut self, entity: EntityId) -> LiveHandle {
                self.0.borrow_mut().subscribed.push(entity);
                let log = self.0.clone();
                LiveHandle::new(move || log.borrow_mut().unsubscribed.push(entity))
            }
        }

        let log = Rc::new(RefCell::new(FeedLog::default()));
        let mut ctx = ViewContext::with_defaults();
        let provider = StubProvider {
            samples: vec![],
            fail: false,
        };

        // An entity present before the source attaches is subscribed then
        let early = Uuid::new_v4();
        ctx.add_entity(early, EntityConfig::default(), &provider)
            .unwrap();
        ctx.set_live_source(Box::new(SharedFeed(log.clone())));
        assert_eq!(log.borrow().subscribed, vec![early]);

        let late = Uuid::new_v4();
        ctx.add_entity(late, EntityConfig::default(), &provider)
            .unwrap();
        assert_eq!(log.borrow().subscribed, vec![early, late]);

        // Destroying an entity detaches exactly its subscription
        ctx.remove_entity(early);
        assert_eq!(log.borrow().unsubscribed, vec![early]);

        // Teardown synchronously detaches whatever is left
        ctx.teardown();
        assert_eq!(log.borrow().unsubscribed, vec![early, late]);
    }

    #[test]
    fn test_teardown_silences_all_paths() {
        let provider = StubProvider {
            samples: vec![raw(0.0, 0.0)],
            fail: false,
        };
        let (mut ctx, entity) = context_with_entity(&provider);
        let events = ctx.subscribe();

        ctx.teardown();
        assert!(ctx.is_torn_down());

        // Everything after teardown is inert
        assert_eq!(ctx.push_live(entity, &raw(50.0, 0.0)), None);
        assert_eq!(ctx.begin_frame(), None);
        ctx.handle_time_event(TimeAuthorityEvent::Tick(10.0));
        assert_eq!(ctx.query_pose(entity, 0.0), PoseQuery::NotYetAvailable);

        // The final event on the feed is TornDown
        let mut last = None;
        while let Ok(ev) = events.try_recv() {
            last = Some(ev);
        }
        assert_eq!(last, Some(ConfigEvent::TornDown));
    }
}
