use std::collections::BTreeSet;

use domain::state::{
    App, CompositionStep, CurrentState, ObservedApp, ObservedService, Service, ServiceDiff,
    TargetState, UpdateStrategy,
};

/// Planner knobs; `force` is carried into the emitted lock steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    pub keep_images: bool,
    pub keep_volumes: bool,
    pub force: bool,
}

/// Named volume part of a `name:/mount` entry; absolute and relative host
/// paths are bind mounts, not managed volumes.
fn named_volume(entry: &str) -> Option<String> {
    let name = entry.split(':').next()?;
    if name.is_empty() || name.starts_with('/') || name.starts_with('.') {
        return None;
    }
    Some(name.to_string())
}

fn declared_networks(app: &App) -> BTreeSet<String> {
    app.services
        .iter()
        .flat_map(|s| s.container_config.networks.iter().cloned())
        .collect()
}

fn declared_volumes(app: &App) -> BTreeSet<String> {
    app.services
        .iter()
        .flat_map(|s| s.container_config.volumes.iter())
        .filter_map(|v| named_volume(v))
        .collect()
}

fn observed_networks(app: &ObservedApp) -> BTreeSet<String> {
    app.services
        .iter()
        .flat_map(|s| s.networks.iter())
        .filter(|n| !matches!(n.as_str(), "bridge" | "host" | "none" | "default"))
        .cloned()
        .collect()
}

fn observed_volumes(app: &ObservedApp) -> BTreeSet<String> {
    app.services
        .iter()
        .flat_map(|s| s.volumes.iter())
        .filter_map(|v| named_volume(v))
        .collect()
}

/// Steps to bring one brand-new app up: resources, pulls, starts. No lock
/// is taken because nothing destructive happens.
fn plan_new_app(app_id: &str, app: &App, steps: &mut Vec<CompositionStep>) {
    for name in declared_networks(app) {
        steps.push(CompositionStep::CreateNetwork { name });
    }
    for name in declared_volumes(app) {
        steps.push(CompositionStep::CreateVolume { name });
    }

    let mut fetched = BTreeSet::new();
    for service in &app.services {
        if fetched.insert(service.image_name.clone()) {
            steps.push(CompositionStep::Fetch {
                image: service.image_name.clone(),
            });
        }
    }
    for service in &app.services {
        if service.wants_running() {
            steps.push(CompositionStep::Start {
                app_id: app_id.to_string(),
                service: service.clone(),
            });
        }
    }
}

/// Steps to tear one app down completely, serialized under its lock.
fn plan_removed_app(
    app_id: &str,
    app: &ObservedApp,
    opts: &PlanOptions,
    steps: &mut Vec<CompositionStep>,
) {
    steps.push(CompositionStep::TakeLock {
        app_id: app_id.to_string(),
        force: opts.force,
    });
    for service in &app.services {
        steps.push(CompositionStep::Stop {
            app_id: app_id.to_string(),
            service_name: service.service_name.clone(),
        });
    }
    for service in &app.services {
        steps.push(CompositionStep::Remove {
            app_id: app_id.to_string(),
            service_name: service.service_name.clone(),
        });
    }
    for name in observed_networks(app) {
        steps.push(CompositionStep::RemoveNetwork { name });
    }
    if !opts.keep_volumes {
        for name in observed_volumes(app) {
            steps.push(CompositionStep::RemoveVolume { name });
        }
    }
    if !opts.keep_images {
        let images: BTreeSet<String> = app.services.iter().map(|s| s.image.clone()).collect();
        for image in images {
            steps.push(CompositionStep::RemoveImage { image });
        }
    }
    steps.push(CompositionStep::ReleaseLock {
        app_id: app_id.to_string(),
    });
}

/// The lock-wrapped swap sequence for one changed service.
fn plan_service_update(
    app_id: &str,
    target: &Service,
    diff: &ServiceDiff,
    steps: &mut Vec<CompositionStep>,
) {
    let app_id = app_id.to_string();
    let service_name = target.service_name.clone();

    match UpdateStrategy::select(diff) {
        UpdateStrategy::DownloadThenKill => {
            steps.push(CompositionStep::Fetch {
                image: target.image_name.clone(),
            });
            steps.push(CompositionStep::Stop {
                app_id: app_id.clone(),
                service_name: service_name.clone(),
            });
            steps.push(CompositionStep::Remove {
                app_id: app_id.clone(),
                service_name,
            });
            steps.push(CompositionStep::Start {
                app_id,
                service: target.clone(),
            });
        }
        UpdateStrategy::KillThenDownload => {
            steps.push(CompositionStep::Stop {
                app_id: app_id.clone(),
                service_name: service_name.clone(),
            });
            steps.push(CompositionStep::Remove {
                app_id: app_id.clone(),
                service_name,
            });
            steps.push(CompositionStep::Fetch {
                image: target.image_name.clone(),
            });
            steps.push(CompositionStep::Start {
                app_id,
                service: target.clone(),
            });
        }
        UpdateStrategy::DeleteThenDownload => {
            steps.push(CompositionStep::Kill {
                app_id: app_id.clone(),
                service_name: service_name.clone(),
            });
            steps.push(CompositionStep::Remove {
                app_id: app_id.clone(),
                service_name,
            });
            for name in &target.container_config.networks {
                steps.push(CompositionStep::CreateNetwork { name: name.clone() });
            }
            steps.push(CompositionStep::Fetch {
                image: target.image_name.clone(),
            });
            steps.push(CompositionStep::Start {
                app_id,
                service: target.clone(),
            });
        }
        UpdateStrategy::Handover => {
            // The new container starts before the old one stops; the
            // executor tells them apart by config hash.
            steps.push(CompositionStep::Fetch {
                image: target.image_name.clone(),
            });
            steps.push(CompositionStep::Start {
                app_id: app_id.clone(),
                service: target.clone(),
            });
            steps.push(CompositionStep::Stop {
                app_id: app_id.clone(),
                service_name: service_name.clone(),
            });
            steps.push(CompositionStep::Remove {
                app_id,
                service_name,
            });
        }
    }
}

/// Diff an app present on both sides. Everything emitted for the app is
/// wrapped in its lock when any step is destructive.
fn plan_changed_app(
    app_id: &str,
    target: &App,
    observed: &ObservedApp,
    opts: &PlanOptions,
    steps: &mut Vec<CompositionStep>,
) {
    let mut app_steps: Vec<CompositionStep> = Vec::new();

    let find_observed = |name: &str| -> Option<&ObservedService> {
        observed.services.iter().find(|s| s.service_name == name)
    };

    for service in &target.services {
        match find_observed(&service.service_name) {
            None => {
                // Service added to an existing app.
                for name in &service.container_config.networks {
                    app_steps.push(CompositionStep::CreateNetwork { name: name.clone() });
                }
                for name in service
                    .container_config
                    .volumes
                    .iter()
                    .filter_map(|v| named_volume(v))
                {
                    app_steps.push(CompositionStep::CreateVolume { name });
                }
                app_steps.push(CompositionStep::Fetch {
                    image: service.image_name.clone(),
                });
                if service.wants_running() {
                    app_steps.push(CompositionStep::Start {
                        app_id: app_id.to_string(),
                        service: service.clone(),
                    });
                }
            }
            Some(current) => {
                let diff = ServiceDiff::compute(service, current);
                if diff.is_unchanged() {
                    continue;
                }
                if diff.is_metadata_only() {
                    app_steps.push(CompositionStep::UpdateMetadata {
                        app_id: app_id.to_string(),
                        service: service.clone(),
                    });
                } else if diff.requires_recreate() {
                    plan_service_update(app_id, service, &diff, &mut app_steps);
                } else if diff.status_changed {
                    // Same definition, wrong run state.
                    if service.wants_running() {
                        app_steps.push(CompositionStep::Start {
                            app_id: app_id.to_string(),
                            service: service.clone(),
                        });
                    } else {
                        app_steps.push(CompositionStep::Stop {
                            app_id: app_id.to_string(),
                            service_name: service.service_name.clone(),
                        });
                    }
                }
            }
        }
    }

    // Services removed from the app.
    for current in &observed.services {
        if !target
            .services
            .iter()
            .any(|s| s.service_name == current.service_name)
        {
            app_steps.push(CompositionStep::Stop {
                app_id: app_id.to_string(),
                service_name: current.service_name.clone(),
            });
            app_steps.push(CompositionStep::Remove {
                app_id: app_id.to_string(),
                service_name: current.service_name.clone(),
            });
        }
    }

    if app_steps.is_empty() {
        return;
    }

    let needs_lock = app_steps.iter().any(|s| s.is_destructive());
    if needs_lock {
        steps.push(CompositionStep::TakeLock {
            app_id: app_id.to_string(),
            force: opts.force,
        });
    }
    steps.append(&mut app_steps);
    if needs_lock {
        steps.push(CompositionStep::ReleaseLock {
            app_id: app_id.to_string(),
        });
    }
}

/// Pure step generation: the minimal ordered list closing the gap between
/// current and target. A stable target yields an empty plan.
pub fn plan_steps(
    current: &CurrentState,
    target: &TargetState,
    opts: &PlanOptions,
) -> Vec<CompositionStep> {
    let mut steps = Vec::new();

    for (app_id, app) in &target.apps {
        match current.apps.get(app_id) {
            None => plan_new_app(app_id, app, &mut steps),
            Some(observed) => plan_changed_app(app_id, app, observed, opts, &mut steps),
        }
    }

    for (app_id, observed) in &current.apps {
        if !target.apps.contains_key(app_id) {
            plan_removed_app(app_id, observed, opts, &mut steps);
        }
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::runtime::ContainerSpec;
    use domain::state::ServiceStatus;
    use std::collections::BTreeMap;

    fn service(name: &str, image: &str) -> Service {
        Service {
            service_id: "1".into(),
            service_name: name.into(),
            image_name: image.into(),
            status: "running".into(),
            container_config: ContainerSpec::default(),
        }
    }

    fn observed(name: &str, image: &str) -> ObservedService {
        ObservedService {
            service_id: "1".into(),
            service_name: name.into(),
            image: image.into(),
            status: ServiceStatus::Running,
            container_id: Some("c1".into()),
            ..Default::default()
        }
    }

    fn target_with(app_id: &str, services: Vec<Service>) -> TargetState {
        TargetState {
            apps: BTreeMap::from([(
                app_id.to_string(),
                App {
                    name: "main".into(),
                    services,
                },
            )]),
            ..Default::default()
        }
    }

    fn current_with(app_id: &str, services: Vec<ObservedService>) -> CurrentState {
        CurrentState {
            apps: BTreeMap::from([(app_id.to_string(), ObservedApp { services, degraded: false })]),
        }
    }

    fn actions(steps: &[CompositionStep]) -> Vec<&'static str> {
        steps.iter().map(|s| s.action()).collect()
    }

    #[test]
    fn test_stable_target_plans_nothing() {
        let target = target_with("1001", vec![service("web", "nginx:1.25")]);
        let current = current_with("1001", vec![observed("web", "nginx:1.25")]);
        let steps = plan_steps(&current, &target, &PlanOptions::default());
        assert!(steps.is_empty(), "got {steps:?}");
    }

    #[test]
    fn test_new_app_creates_resources_then_starts() {
        let mut svc = service("web", "nginx:1.25");
        svc.container_config.networks = vec!["backend".into()];
        svc.container_config.volumes = vec!["data:/var/lib/data".into()];
        let target = target_with("1001", vec![svc]);

        let steps = plan_steps(&CurrentState::default(), &target, &PlanOptions::default());
        assert_eq!(
            actions(&steps),
            vec!["createNetwork", "createVolume", "fetch", "start"]
        );
    }

    #[test]
    fn test_image_swap_is_lock_wrapped_download_then_kill() {
        let target = target_with("1001", vec![service("web", "nginx:1.25")]);
        let current = current_with("1001", vec![observed("web", "nginx:1.24")]);

        let steps = plan_steps(&current, &target, &PlanOptions::default());
        assert_eq!(
            actions(&steps),
            vec!["takeLock", "fetch", "stop", "remove", "start", "releaseLock"]
        );
        match &steps[1] {
            CompositionStep::Fetch { image } => assert_eq!(image, "nginx:1.25"),
            other => panic!("expected fetch, got {other:?}"),
        }
        match &steps[0] {
            CompositionStep::TakeLock { app_id, .. } => assert_eq!(app_id, "1001"),
            other => panic!("expected takeLock, got {other:?}"),
        }
    }

    #[test]
    fn test_port_change_stops_before_fetch() {
        let mut svc = service("web", "nginx:1.25");
        svc.container_config.ports = vec!["9090:80".into()];
        let target = target_with("1001", vec![svc]);
        let current = current_with("1001", vec![observed("web", "nginx:1.25")]);

        let steps = plan_steps(&current, &target, &PlanOptions::default());
        assert_eq!(
            actions(&steps),
            vec!["takeLock", "stop", "remove", "fetch", "start", "releaseLock"]
        );
    }

    #[test]
    fn test_removed_app_is_torn_down_under_lock() {
        let mut gone = observed("web", "nginx:1.24");
        gone.volumes = vec!["data:/var/lib/data".into()];
        gone.networks = vec!["backend".into()];
        let current = current_with("1001", vec![gone]);

        let steps = plan_steps(&current, &TargetState::default(), &PlanOptions::default());
        assert_eq!(
            actions(&steps),
            vec![
                "takeLock",
                "stop",
                "remove",
                "removeNetwork",
                "removeVolume",
                "removeImage",
                "releaseLock"
            ]
        );
    }

    #[test]
    fn test_keep_flags_suppress_removals() {
        let mut gone = observed("web", "nginx:1.24");
        gone.volumes = vec!["data:/var/lib/data".into()];
        let current = current_with("1001", vec![gone]);

        let opts = PlanOptions {
            keep_images: true,
            keep_volumes: true,
            force: false,
        };
        let steps = plan_steps(&current, &TargetState::default(), &opts);
        let acts = actions(&steps);
        assert!(!acts.contains(&"removeVolume"));
        assert!(!acts.contains(&"removeImage"));
    }

    #[test]
    fn test_metadata_only_change() {
        let mut svc = service("web", "nginx:1.25");
        svc.container_config
            .labels
            .insert("tier".into(), "frontend".into());
        let target = target_with("1001", vec![svc]);
        let current = current_with("1001", vec![observed("web", "nginx:1.25")]);

        let steps = plan_steps(&current, &target, &PlanOptions::default());
        assert_eq!(actions(&steps), vec!["updateMetadata"]);
    }

    #[test]
    fn test_stopped_service_with_running_target_is_started() {
        let target = target_with("1001", vec![service("web", "nginx:1.25")]);
        let mut stopped = observed("web", "nginx:1.25");
        stopped.status = ServiceStatus::Exited;
        let current = current_with("1001", vec![stopped]);

        let steps = plan_steps(&current, &target, &PlanOptions::default());
        assert_eq!(actions(&steps), vec!["start"]);
    }

    #[test]
    fn test_handover_starts_new_before_stopping_old() {
        let mut svc = service("web", "nginx:1.25");
        svc.container_config
            .labels
            .insert("io.lattice.update-strategy".into(), "handover".into());
        let target = target_with("1001", vec![svc]);
        let current = current_with("1001", vec![observed("web", "nginx:1.24")]);

        let steps = plan_steps(&current, &target, &PlanOptions::default());
        assert_eq!(
            actions(&steps),
            vec!["takeLock", "fetch", "start", "stop", "remove", "releaseLock"]
        );
    }

    #[test]
    fn test_bounded_force_is_carried_into_lock() {
        let target = target_with("1001", vec![service("web", "nginx:1.25")]);
        let current = current_with("1001", vec![observed("web", "nginx:1.24")]);

        let opts = PlanOptions {
            force: true,
            ..Default::default()
        };
        let steps = plan_steps(&current, &target, &opts);
        match &steps[0] {
            CompositionStep::TakeLock { force, .. } => assert!(force),
            other => panic!("expected takeLock, got {other:?}"),
        }
    }
}
