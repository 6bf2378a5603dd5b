use crate::error::EngineError;

use super::model::{DeployConfig, DeployPlan};

/// C7: parse a Deploy Task's YAML body into the normalized `DeployConfig`.
/// Handles the legacy-to-unified compatibility shim (spec §4.7): when the
/// top-level `deploy` block is absent, it is derived from the first
/// target's `docker` sub-block and applied to all targets.
pub fn parse(yaml: &str) -> Result<DeployConfig, EngineError> {
    let mut raw: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| EngineError::Validation(format!("invalid YAML: {e}")))?;

    upgrade_legacy_docker_block(&mut raw);

    let config: DeployConfig = serde_yaml::from_value(raw)
        .map_err(|e| EngineError::Validation(format!("invalid deploy config: {e}")))?;
    validate(&config)?;
    Ok(config)
}

/// Re-emit the canonical YAML for a parsed config (used for the export
/// endpoint and the round-trip property in spec §8).
pub fn to_yaml(config: &DeployConfig) -> Result<String, EngineError> {
    serde_yaml::to_string(config).map_err(|e| EngineError::Internal(e.to_string()))
}

fn upgrade_legacy_docker_block(raw: &mut serde_yaml::Value) {
    let serde_yaml::Value::Mapping(map) = raw else { return };
    let deploy_key = serde_yaml::Value::String("deploy".to_string());
    if map.contains_key(&deploy_key) {
        return;
    }

    let targets_key = serde_yaml::Value::String("targets".to_string());
    let Some(serde_yaml::Value::Sequence(targets)) = map.get(&targets_key) else { return };
    let Some(serde_yaml::Value::Mapping(first)) = targets.first() else { return };
    let docker_key = serde_yaml::Value::String("docker".to_string());
    let Some(docker_block) = first.get(&docker_key).cloned() else { return };

    let mut deploy_value = docker_block;
    if let serde_yaml::Value::Mapping(ref mut dm) = deploy_value {
        let type_key = serde_yaml::Value::String("type".to_string());
        if !dm.contains_key(&type_key) {
            dm.insert(type_key, serde_yaml::Value::String("docker_run".to_string()));
        }
    }
    map.insert(deploy_key, deploy_value);
}

fn validate(config: &DeployConfig) -> Result<(), EngineError> {
    if config.app.name.trim().is_empty() {
        return Err(EngineError::Validation("app.name is required".to_string()));
    }
    if config.targets.is_empty() {
        return Err(EngineError::Validation("at least one target is required".to_string()));
    }
    for target in &config.targets {
        if target.host_name.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "target `{}` is missing host_name",
                target.name
            )));
        }
    }
    match &config.deploy {
        DeployPlan::DockerRun { command, .. } if command.trim().is_empty() => {
            Err(EngineError::Validation("docker_run plan requires a command".to_string()))
        }
        DeployPlan::DockerCompose {
            command,
            compose_content,
            ..
        } if command.trim().is_empty() || compose_content.trim().is_empty() => Err(EngineError::Validation(
            "docker_compose plan requires command and compose_content".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::model::HostType;

    #[test]
    fn parses_docker_run_plan() {
        let yaml = r#"
app:
  name: demo
deploy:
  type: docker_run
  command: "docker run -d --name svc acme/app:1.0"
  redeploy: true
targets:
  - name: prod
    host_type: ssh
    host_name: box1
"#;
        let config = parse(yaml).unwrap();
        match config.deploy {
            DeployPlan::DockerRun { command, redeploy } => {
                assert_eq!(command, "-d --name svc acme/app:1.0");
                assert!(redeploy);
            }
            _ => panic!("expected docker_run"),
        }
        assert_eq!(config.targets[0].host_type, HostType::Ssh);
    }

    #[test]
    fn parses_steps_plan_without_type_tag() {
        let yaml = r#"
app:
  name: demo
deploy:
  steps:
    - name: pull
      command: "docker pull acme/app:1.0"
    - name: restart
      command: "systemctl restart app"
targets:
  - name: prod
    host_type: agent
    host_name: box1
"#;
        let config = parse(yaml).unwrap();
        match config.deploy {
            DeployPlan::Steps { steps, .. } => assert_eq!(steps.len(), 2),
            _ => panic!("expected steps"),
        }
    }

    #[test]
    fn derives_deploy_block_from_legacy_docker_block() {
        let yaml = r#"
app:
  name: legacy
targets:
  - name: prod
    host_type: ssh
    host_name: box1
    docker:
      command: "-d --name svc acme/legacy:1.0"
      redeploy: true
  - name: staging
    host_type: ssh
    host_name: box2
"#;
        let config = parse(yaml).unwrap();
        match config.deploy {
            DeployPlan::DockerRun { command, redeploy } => {
                assert_eq!(command, "-d --name svc acme/legacy:1.0");
                assert!(redeploy);
            }
            _ => panic!("expected docker_run derived from legacy block"),
        }
        assert_eq!(config.targets.len(), 2);
    }

    #[test]
    fn missing_app_name_rejected() {
        let yaml = r#"
app:
  name: ""
deploy:
  type: docker_run
  command: "run me"
targets:
  - name: prod
    host_type: ssh
    host_name: box1
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn round_trips_through_reemission() {
        let yaml = r#"
app:
  name: demo
deploy:
  type: docker_compose
  command: "up -d"
  compose_content: "services:\n  web:\n    image: nginx\n"
targets:
  - name: prod
    host_type: portainer
    host_name: env1
"#;
        let first = parse(yaml).unwrap();
        let reemitted = to_yaml(&first).unwrap();
        let second = parse(&reemitted).unwrap();
        assert_eq!(first.app.name, second.app.name);
        assert_eq!(first.deploy, second.deploy);
        assert_eq!(first.targets, second.targets);
    }
}
