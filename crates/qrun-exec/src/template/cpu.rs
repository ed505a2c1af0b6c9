//! General-purpose compute template

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PodSpec;

use super::{
    code_mount, code_volume, pod_template, runner_container, ExecutionTemplate, TemplateInput,
    TemplatePlugin,
};
use crate::error::ExecError;
use crate::target::Target;

/// Plain container, no resource requests
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuJobPlugin;

#[async_trait]
impl TemplatePlugin for CpuJobPlugin {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn make_template(
        &self,
        input: &TemplateInput<'_>,
    ) -> Result<Option<ExecutionTemplate>, ExecError> {
        if input.target != Target::Cpu {
            return Ok(None);
        }

        let mut container =
            runner_container(input.image, input.env.secret_refs(input.identity.env_holder()));
        container.image_pull_policy = Some("Always".to_string());
        container.volume_mounts = Some(vec![code_mount()]);

        let spec = PodSpec {
            containers: vec![container],
            volumes: Some(vec![code_volume(input.identity)]),
            ..Default::default()
        };

        Ok(Some(pod_template(input, spec)))
    }
}
