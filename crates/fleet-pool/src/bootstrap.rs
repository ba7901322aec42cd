//! Cluster join material and Instance synthesis
//!
//! New machines join the cluster with a token and the ingress address. The
//! token comes from configuration or from the node's bootstrap document; the
//! address from the ingress Service. Both are baked into the boot
//! configuration of every synthesized Instance.

use std::collections::BTreeMap;
use std::path::Path;

use kube::{Resource, ResourceExt};

use fleet_common::cloud_init::BootConfig;
use fleet_common::crd::{Instance, InstancePool, InstanceSpec};
use fleet_common::kube_utils::{random_letters, random_lowercase};
use fleet_common::{
    Error, MetalCredentials, OperatorConfig, PASSWORD_ANNOTATION, POOL_LABEL,
    REINSTALL_IPXE_ANNOTATION, TOKEN_ANNOTATION,
};

/// Operating system selector that boots from a custom iPXE script
pub const CUSTOM_IPXE_OS: &str = "custom_ipxe";

/// Length of the random suffix of Instance names
pub const NAME_SUFFIX_LEN: usize = 8;

/// Length of generated admin passwords
pub const PASSWORD_LEN: usize = 16;

/// Resolve the cluster join token
///
/// A token set in configuration wins; otherwise the `token` key of the YAML
/// bootstrap document is used.
pub async fn resolve_join_token(config: &OperatorConfig) -> Result<String, Error> {
    if let Some(token) = config.join_token.as_deref().filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }
    read_token_file(&config.bootstrap_config_path).await
}

async fn read_token_file(path: &Path) -> Result<String, Error> {
    let context = path.display().to_string();
    let document = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::configuration(&context, format!("unable to read bootstrap document: {e}")))?;
    token_from_document(&document).map_err(|msg| Error::configuration(&context, msg))
}

/// Extract the `token` key of a bootstrap document
pub fn token_from_document(document: &str) -> Result<String, String> {
    let value: serde_yaml::Value = serde_yaml::from_str(document)
        .map_err(|e| format!("unable to parse bootstrap document: {e}"))?;
    value
        .get("token")
        .and_then(serde_yaml::Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "no token found in bootstrap document".to_string())
}

/// Everything a pool needs to stamp out Instances
#[derive(Debug)]
pub struct JoinMaterial<'a> {
    /// Provisioning credentials copied into every Instance
    pub credentials: &'a MetalCredentials,
    /// Cluster join token
    pub token: &'a str,
    /// Address new machines join through
    pub join_address: &'a str,
}

/// Build a new Instance of `pool`
///
/// The Instance gets a random name under the pool, the pool's template
/// fields, an owner reference and label pointing at the pool, and the
/// annotations and boot configuration its machine needs to join.
pub fn synthesize_instance(
    pool: &InstancePool,
    material: &JoinMaterial<'_>,
    config: &OperatorConfig,
) -> Result<Instance, Error> {
    let pool_name = pool.name_any();
    let owner = pool.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(&pool_name, "pool has no uid to own Instances")
    })?;
    let name = format!("{pool_name}-{}", random_lowercase(NAME_SUFFIX_LEN));
    let password = random_letters(PASSWORD_LEN);

    let template = &pool.spec;
    let iso_url = template.iso_url.as_deref().unwrap_or(&config.iso_url);
    let userdata = BootConfig::join(
        material.join_address,
        material.token,
        name.clone(),
        password.clone(),
        iso_url,
    )
    .render()?;

    let management_interfaces = if template.management_interfaces.is_empty() {
        vec![config.default_interface.clone()]
    } else {
        template.management_interfaces.clone()
    };
    let reinstall_ipxe = template
        .ipxe_script_url
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| config.ipxe_script_url.clone());

    let mut instance = Instance::new(
        &name,
        InstanceSpec {
            plan: template.plan.clone(),
            facility: template.facility.clone(),
            metro: template.metro.clone(),
            operating_system: CUSTOM_IPXE_OS.to_string(),
            billing_cycle: template.billing_cycle.clone(),
            project_id: Some(material.credentials.project_id.clone()),
            userdata: Some(userdata),
            ipxe_script_url: Some(config.initial_ipxe_script_url.clone()),
            spot_instance: template.spot_instance,
            spot_price_max: template.spot_price_max,
            custom_data: template.custom_data.clone(),
            user_ssh_keys: template.user_ssh_keys.clone(),
            project_ssh_keys: template.project_ssh_keys.clone(),
            features: template.features.clone(),
            no_ssh_keys: template.no_ssh_keys,
            node_cleanup_wait_interval: template.node_cleanup_wait_interval.clone(),
            management_interfaces,
            management_bonding_options: template.management_bonding_options.clone(),
            networking_configuration: template.networking_configuration.clone(),
            ..Default::default()
        },
    );
    instance.metadata.owner_references = Some(vec![owner]);
    instance.metadata.labels = Some(BTreeMap::from([(POOL_LABEL.to_string(), pool_name)]));
    instance.metadata.annotations = Some(BTreeMap::from([
        (TOKEN_ANNOTATION.to_string(), material.credentials.token.clone()),
        (PASSWORD_ANNOTATION.to_string(), password),
        (REINSTALL_IPXE_ANNOTATION.to_string(), reinstall_ipxe),
    ]));
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::cloud_init::MANAGEMENT_NETWORK;
    use fleet_common::crd::InstancePoolSpec;
    use fleet_common::relations::owning_pool;

    fn pool() -> InstancePool {
        let mut pool = InstancePool::new(
            "edge",
            InstancePoolSpec {
                count: 2,
                plan: "c3.small.x86".into(),
                metro: Some("da".into()),
                billing_cycle: "hourly".into(),
                node_cleanup_wait_interval: Some("10m".into()),
                ..Default::default()
            },
        );
        pool.metadata.uid = Some("uid-1".into());
        pool
    }

    fn material(credentials: &MetalCredentials) -> JoinMaterial<'_> {
        JoinMaterial {
            credentials,
            token: "K10::join",
            join_address: "10.0.0.5",
        }
    }

    #[test]
    fn token_is_read_from_bootstrap_document() {
        let doc = "server: https://10.0.0.5:8443\ntoken: K10abc::server:xyz\n";
        assert_eq!(token_from_document(doc).unwrap(), "K10abc::server:xyz");
        assert!(token_from_document("server: x\n").is_err());
        assert!(token_from_document(": : :").is_err());
    }

    #[tokio::test]
    async fn configured_token_takes_precedence() {
        let config = OperatorConfig {
            join_token: Some("from-env".into()),
            bootstrap_config_path: "/nonexistent/config.yaml".into(),
            ..Default::default()
        };
        assert_eq!(resolve_join_token(&config).await.unwrap(), "from-env");
    }

    #[tokio::test]
    async fn unreadable_bootstrap_document_is_configuration_error() {
        let config = OperatorConfig {
            join_token: None,
            bootstrap_config_path: "/nonexistent/config.yaml".into(),
            ..Default::default()
        };
        let err = resolve_join_token(&config).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn synthesized_instance_carries_pool_template_and_join_material() {
        let credentials = MetalCredentials::new("metal-token", "proj-1");
        let config = OperatorConfig::default();
        let instance = synthesize_instance(&pool(), &material(&credentials), &config).unwrap();

        let name = instance.name_any();
        let suffix = name.strip_prefix("edge-").unwrap();
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));

        assert_eq!(instance.spec.operating_system, CUSTOM_IPXE_OS);
        assert_eq!(instance.spec.plan, "c3.small.x86");
        assert_eq!(instance.spec.project_id.as_deref(), Some("proj-1"));
        assert_eq!(instance.spec.management_interfaces, vec!["eth0"]);
        assert_eq!(
            instance.spec.ipxe_script_url.as_deref(),
            Some(config.initial_ipxe_script_url.as_str())
        );
        assert_eq!(instance.api_token(), Some("metal-token"));
        assert_eq!(instance.password().map(str::len), Some(PASSWORD_LEN));
        assert_eq!(
            instance.reinstall_ipxe_url(),
            Some(config.ipxe_script_url.as_str())
        );
        assert_eq!(instance.pool_name(), Some("edge"));
        assert_eq!(owning_pool(&instance).as_deref(), Some("edge"));
        assert!(instance.status.is_none());

        let boot = BootConfig::parse(instance.spec.userdata.as_deref().unwrap()).unwrap();
        assert_eq!(boot.server_url, "https://10.0.0.5:8443");
        assert_eq!(boot.token, "K10::join");
        assert_eq!(boot.os.hostname, name);
        assert_eq!(Some(boot.os.password.as_str()), instance.password());
        assert_eq!(boot.install.iso_url, config.iso_url);
        assert!(!boot.install.networks.contains_key(MANAGEMENT_NETWORK));
    }

    #[test]
    fn pool_overrides_boot_settings() {
        let mut pool = pool();
        pool.spec.ipxe_script_url = Some("https://boot/custom.ipxe".into());
        pool.spec.iso_url = Some("https://iso/custom.iso".into());
        pool.spec.management_interfaces = vec!["eth0".into(), "eth1".into()];
        let credentials = MetalCredentials::new("t", "p");

        let instance =
            synthesize_instance(&pool, &material(&credentials), &OperatorConfig::default())
                .unwrap();

        assert_eq!(instance.reinstall_ipxe_url(), Some("https://boot/custom.ipxe"));
        assert_eq!(instance.spec.management_interfaces, vec!["eth0", "eth1"]);
        let boot = BootConfig::parse(instance.spec.userdata.as_deref().unwrap()).unwrap();
        assert_eq!(boot.install.iso_url, "https://iso/custom.iso");
    }

    #[test]
    fn pool_without_uid_cannot_own_instances() {
        let mut pool = pool();
        pool.metadata.uid = None;
        let credentials = MetalCredentials::new("t", "p");
        assert!(
            synthesize_instance(&pool, &material(&credentials), &OperatorConfig::default())
                .is_err()
        );
    }
}
