//! Demo scene: a spinning turntable with an arm that logs a heartbeat.

use engine_bus::topics;
use engine_component::{
    COMPONENT_TYPE, Component, ComponentContext, FrameTime, Runtime, Scene, Stage, StageError,
    StageResult, component_constructor,
};
use engine_math::{Quat, Transform3D, Vec3};
use engine_reflect::{ReflectError, TypeDescriptor, reflect};
use engine_server::{Server, ServerError};
use tracing::info;

/// Name of the scene the demo populates.
pub const DEMO_SCENE: &str = "demo";

pub static SPINNER_TYPE: TypeDescriptor = TypeDescriptor::new("Spinner", Some(&COMPONENT_TYPE))
    .with_constructor(component_constructor::<Spinner>);

pub static HEARTBEAT_TYPE: TypeDescriptor =
    TypeDescriptor::new("Heartbeat", Some(&COMPONENT_TYPE))
        .with_constructor(component_constructor::<Heartbeat>);

/// Rotates its entity about the Y axis every Update.
#[derive(Debug)]
pub struct Spinner {
    pub degrees_per_second: f32,
}

impl Default for Spinner {
    fn default() -> Self {
        Self {
            degrees_per_second: 90.0,
        }
    }
}

reflect!(Spinner, SPINNER_TYPE);

impl Component for Spinner {
    fn on_activate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        ctx.register_stage(Stage::Update)?;
        Ok(())
    }

    fn on_update(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        let delta = ctx.time().delta as f32;
        let step = Quat::from_rotation_y((self.degrees_per_second * delta).to_radians());
        let entity = ctx.entity();
        entity
            .set_transform(entity.transform().rotated(step))
            .map_err(|err| StageError::fatal(err.to_string()))
    }
}

/// Logs the entity's world position every `interval` frames.
#[derive(Debug)]
pub struct Heartbeat {
    pub interval: u64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self { interval: 60 }
    }
}

reflect!(Heartbeat, HEARTBEAT_TYPE);

impl Component for Heartbeat {
    fn on_activate(&mut self, ctx: &ComponentContext<'_>) -> StageResult {
        let interval = self.interval.max(1);
        let entity = ctx.entity().downgrade();
        ctx.subscribe_to::<FrameTime>(topics::TIMER_FRAME, move |time| {
            if time.frame % interval != 0 {
                return;
            }
            if let Some(entity) = entity.upgrade() {
                let position = entity.world_transform().w_axis.truncate();
                info!(
                    entity = %entity.name(),
                    frame = time.frame,
                    elapsed = time.elapsed,
                    x = position.x,
                    z = position.z,
                    "heartbeat"
                );
            }
        })?;
        Ok(())
    }
}

/// Make the demo component types constructible by name.
///
/// # Errors
///
/// Returns [`ReflectError::Conflict`] if another type already uses one of the
/// names.
pub fn register(runtime: &Runtime) -> Result<(), ReflectError> {
    runtime.register_type(&SPINNER_TYPE)?;
    runtime.register_type(&HEARTBEAT_TYPE)?;
    Ok(())
}

/// Build the demo entities in the [`DEMO_SCENE`] scene, opening it first if
/// the config did not.
///
/// # Errors
///
/// Returns the first scene, entity or component failure.
pub fn populate(server: &Server) -> Result<Scene, ServerError> {
    let scene = match server.find_scene(DEMO_SCENE) {
        Some(scene) => scene,
        None => {
            let scene = server.create_scene(DEMO_SCENE);
            server.open_scene(&scene)?;
            scene
        }
    };

    let turntable = scene.spawn("turntable")?;
    turntable.add_component_named(SPINNER_TYPE.name())?;

    let arm = scene.spawn("arm")?;
    arm.set_parent(Some(&turntable))?;
    arm.set_transform(Transform3D::from_position(Vec3::X * 2.0))?;
    arm.add_component(Heartbeat::default())?;

    info!(scene = scene.name(), "demo scene populated");
    Ok(scene)
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_4;

    use engine_server::ServerConfig;

    use super::*;

    fn demo_server() -> (Server, Scene) {
        let server = Server::from_config(
            ServerConfig::new("demo")
                .with_fixed_timestep(0.5)
                .with_feature("TimerFeature"),
        )
        .unwrap();
        register(server.runtime()).unwrap();
        let scene = populate(&server).unwrap();
        server.set_active(true).unwrap();
        (server, scene)
    }

    #[test]
    fn test_populate_builds_hierarchy() {
        let (server, scene) = demo_server();
        let turntable = scene.find("turntable").unwrap();
        let arm = turntable.find_child("arm", false).unwrap();
        assert!(arm.is_active_in_hierarchy());
        assert!(turntable.get_component::<Spinner>().is_some());
        assert!(arm.get_component::<Heartbeat>().is_some());
        assert_eq!(server.find_scene(DEMO_SCENE), Some(scene));
    }

    #[test]
    fn test_spinner_rotates_child_with_it() {
        let (server, scene) = demo_server();
        server.update_with(0.5).unwrap();

        let turntable = scene.find("turntable").unwrap();
        let angle = turntable.transform().rotation.angle_between(Quat::IDENTITY);
        assert!((angle - FRAC_PI_4).abs() < 1e-4);

        let arm = turntable.find_child("arm", false).unwrap();
        let position = arm.world_transform().w_axis.truncate();
        assert!((position.length() - 2.0).abs() < 1e-4);
        assert!(position.z.abs() > 1.0);
    }

    #[test]
    fn test_reuses_configured_scene() {
        let server = Server::from_config(ServerConfig::new("demo").with_scene(DEMO_SCENE)).unwrap();
        register(server.runtime()).unwrap();
        let scene = populate(&server).unwrap();
        assert_eq!(server.scenes().len(), 1);
        assert!(scene.find("turntable").is_some());
    }
}
