//! Accelerator template

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use qrun_common::config::AcceleratorConfig;

use super::{
    code_mount, code_volume, pod_template, runner_container, ExecutionTemplate, TemplateInput,
    TemplatePlugin,
};
use crate::error::ExecError;
use crate::target::Target;

/// Container with accelerator requests/limits and the accelerator runtime class
#[derive(Debug, Clone)]
pub struct GpuJobPlugin {
    config: AcceleratorConfig,
}

impl GpuJobPlugin {
    pub fn new(config: AcceleratorConfig) -> Self {
        Self { config }
    }

    fn resources(&self) -> ResourceRequirements {
        let quantity = |v: &str| Quantity(v.to_string());
        let count = self.config.count.to_string();

        let limits = BTreeMap::from([
            ("cpu".to_string(), quantity(&self.config.cpu)),
            (
                "ephemeral-storage".to_string(),
                quantity(&self.config.ephemeral_storage),
            ),
            ("memory".to_string(), quantity(&self.config.memory)),
            (self.config.resource_name.clone(), quantity(&count)),
        ]);
        // Scratch space is capped but not reserved
        let requests = BTreeMap::from([
            ("cpu".to_string(), quantity(&self.config.cpu)),
            ("ephemeral-storage".to_string(), quantity("0")),
            ("memory".to_string(), quantity(&self.config.memory)),
            (self.config.resource_name.clone(), quantity(&count)),
        ]);

        ResourceRequirements {
            limits: Some(limits),
            requests: Some(requests),
            ..Default::default()
        }
    }
}

#[async_trait]
impl TemplatePlugin for GpuJobPlugin {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn make_template(
        &self,
        input: &TemplateInput<'_>,
    ) -> Result<Option<ExecutionTemplate>, ExecError> {
        if input.target != Target::Gpu {
            return Ok(None);
        }
        if self.config.count == 0 {
            return Err(ExecError::configuration(
                "accelerator count must be at least 1",
            ));
        }

        let mut container =
            runner_container(input.image, input.env.secret_refs(input.identity.env_holder()));
        container.image_pull_policy = Some("Always".to_string());
        container.volume_mounts = Some(vec![code_mount()]);
        container.resources = Some(self.resources());

        let spec = PodSpec {
            containers: vec![container],
            volumes: Some(vec![code_volume(input.identity)]),
            runtime_class_name: Some(self.config.runtime_class.clone()),
            ..Default::default()
        };

        Ok(Some(pod_template(input, spec)))
    }
}
