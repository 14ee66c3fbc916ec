//! Command-backed capabilities
//!
//! Each operation runs an operator-supplied command template through the
//! platform shell. Exit code 0 is success, 75 a transient failure, 78 an
//! unusable environment, anything else a step failure. Predicates read
//! exit 0 as true and exit 1 as false.
//!
//! Placeholder values are substituted already quoted for the shell, so a
//! template writes `{device}`, never `'{device}'`.

use crate::context::CapabilityContext;
use crate::error::{CapabilityError, ErrorClass, Result};
use crate::traits::Capabilities;
use async_trait::async_trait;
use ferry_model::{CommandTemplates, ProfileMapping};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

/// Substitute `{name}` placeholders in a template with quoted values
///
/// Unknown placeholders are left as written. Substituted text is never
/// expanded again.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut line = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        line.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| (close, *value))
        });
        match value {
            Some((close, value)) => {
                line.push_str(&quote(value));
                rest = &after[close + 1..];
            }
            None => {
                line.push('{');
                rest = after;
            }
        }
    }
    line.push_str(rest);
    line
}

/// Quote a value as a single word for the platform shell
pub fn quote(value: &str) -> String {
    if cfg!(windows) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

fn shell(line: &str) -> Command {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c");
        c
    };
    command.arg(line).kill_on_drop(true);
    command
}

/// Run a rendered command line, bounded by the context's timeout
pub async fn run_line(ctx: &CapabilityContext, operation: &str, line: &str) -> Result<Output> {
    debug!(device = %ctx.device_id(), operation = %operation, command = %line, "Running command");

    let mut command = shell(line);
    command.envs(ctx.environment());

    let output = match ctx.timeout() {
        Some(timeout) => tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| CapabilityError::Timeout {
                operation: operation.to_string(),
                timeout,
            })??,
        None => command.output().await?,
    };
    Ok(output)
}

/// Map a non-zero exit to a classified error
pub fn check_status(operation: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(CapabilityError::Command {
        operation: operation.to_string(),
        code: output.status.code(),
        message: describe(output),
    })
}

/// Read a predicate result: exit 0 is true, exit 1 is false
pub fn check_predicate(operation: &str, output: &Output) -> Result<bool> {
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => check_status(operation, output).map(|_| false),
    }
}

fn describe(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.to_string()
    }
}

/// Capabilities implemented by external commands
pub struct CommandCapabilities {
    templates: CommandTemplates,
}

impl CommandCapabilities {
    pub fn new(templates: CommandTemplates) -> Self {
        Self { templates }
    }

    /// Operations every migration needs that have no command configured
    pub fn missing_templates(&self) -> Vec<&'static str> {
        let t = &self.templates;
        let required = [
            ("sourceManagementPresent", &t.source_management_present),
            ("removeSourceManagement", &t.remove_source_management),
            ("prepareTargetEnrollment", &t.prepare_target_enrollment),
            ("joinTargetDirectory", &t.join_target_directory),
            ("enrollTargetManagement", &t.enroll_target_management),
            ("verifyEnrollment", &t.verify_enrollment),
            ("captureComponent", &t.capture_component),
            ("restoreComponent", &t.restore_component),
        ];
        required
            .iter()
            .filter(|(_, template)| template.is_none())
            .map(|(name, _)| *name)
            .collect()
    }

    fn template<'a>(&self, operation: &str, template: &'a Option<String>) -> Result<&'a str> {
        template
            .as_deref()
            .ok_or_else(|| CapabilityError::NotConfigured(operation.to_string()))
    }

    async fn run(
        &self,
        ctx: &CapabilityContext,
        operation: &str,
        template: &str,
        extra: &[(&str, &str)],
    ) -> Result<Output> {
        let mut vars = vec![("device", ctx.device_id())];
        vars.extend_from_slice(extra);
        run_line(ctx, operation, &render(template, &vars)).await
    }

    /// Run a mutating operation
    async fn mutate(
        &self,
        ctx: &CapabilityContext,
        operation: &str,
        template: &Option<String>,
        extra: &[(&str, &str)],
    ) -> Result<()> {
        let template = self.template(operation, template)?;
        let output = self.run(ctx, operation, template, extra).await?;
        check_status(operation, &output)
    }

    async fn predicate(
        &self,
        ctx: &CapabilityContext,
        operation: &str,
        template: &Option<String>,
        extra: &[(&str, &str)],
    ) -> Result<bool> {
        let template = self.template(operation, template)?;
        let output = self.run(ctx, operation, template, extra).await?;
        check_predicate(operation, &output)
    }
}

#[async_trait]
impl Capabilities for CommandCapabilities {
    fn name(&self) -> &str {
        "command"
    }

    async fn preflight(&self, ctx: &CapabilityContext) -> Result<()> {
        let missing = self.missing_templates();
        if !missing.is_empty() {
            return Err(CapabilityError::NotConfigured(missing.join(", ")));
        }

        let t = &self.templates;
        let Some(template) = t.preflight.as_deref() else {
            return Ok(());
        };
        let output = self.run(ctx, "preflight", template, &[]).await?;
        match check_status("preflight", &output) {
            Err(e) if e.class() == ErrorClass::StepFailure => {
                Err(CapabilityError::EnvironmentFatal(e.to_string()))
            }
            other => other,
        }
    }

    async fn source_management_present(&self, ctx: &CapabilityContext) -> Result<bool> {
        self.predicate(ctx, "sourceManagementPresent", &self.templates.source_management_present, &[])
            .await
    }

    async fn remove_source_management(&self, ctx: &CapabilityContext) -> Result<()> {
        self.mutate(ctx, "removeSourceManagement", &self.templates.remove_source_management, &[])
            .await
    }

    async fn prepare_target_enrollment(&self, ctx: &CapabilityContext) -> Result<()> {
        self.mutate(ctx, "prepareTargetEnrollment", &self.templates.prepare_target_enrollment, &[])
            .await
    }

    async fn join_target_directory(&self, ctx: &CapabilityContext) -> Result<()> {
        self.mutate(ctx, "joinTargetDirectory", &self.templates.join_target_directory, &[])
            .await
    }

    async fn enroll_target_management(&self, ctx: &CapabilityContext) -> Result<()> {
        self.mutate(ctx, "enrollTargetManagement", &self.templates.enroll_target_management, &[])
            .await
    }

    /// Expects `{"sourceSid": .., "targetAccount": ..}` on stdout, or nothing
    async fn discover_profile(&self, ctx: &CapabilityContext) -> Result<Option<ProfileMapping>> {
        let Some(template) = self.templates.discover_profile.as_deref() else {
            return Ok(None);
        };
        let output = self.run(ctx, "discoverProfile", template, &[]).await?;
        check_status("discoverProfile", &output)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(stdout)?))
    }

    async fn transfer_user_profile(
        &self,
        ctx: &CapabilityContext,
        source_sid: &str,
        target_account: &str,
    ) -> Result<()> {
        self.mutate(
            ctx,
            "transferUserProfile",
            &self.templates.transfer_user_profile,
            &[("sourceSid", source_sid), ("targetAccount", target_account)],
        )
        .await
    }

    async fn verify_enrollment(&self, ctx: &CapabilityContext) -> Result<(bool, String)> {
        let template = self.template("verifyEnrollment", &self.templates.verify_enrollment)?;
        let output = self.run(ctx, "verifyEnrollment", template, &[]).await?;
        let enrolled = check_predicate("verifyEnrollment", &output)?;

        let mut detail = describe(&output);
        if detail.is_empty() {
            detail = if enrolled { "enrolled" } else { "not enrolled" }.to_string();
        }
        Ok((enrolled, detail))
    }

    async fn application_installed(
        &self,
        ctx: &CapabilityContext,
        application: &str,
    ) -> Result<bool> {
        self.predicate(
            ctx,
            "applicationInstalled",
            &self.templates.application_installed,
            &[("application", application)],
        )
        .await
    }

    async fn policy_marker_present(&self, ctx: &CapabilityContext, marker: &str) -> Result<bool> {
        self.predicate(
            ctx,
            "policyMarkerPresent",
            &self.templates.policy_marker_present,
            &[("marker", marker)],
        )
        .await
    }

    async fn capture_component(
        &self,
        ctx: &CapabilityContext,
        component: &str,
        location: &Path,
    ) -> Result<()> {
        let location = location.display().to_string();
        self.mutate(
            ctx,
            "captureComponent",
            &self.templates.capture_component,
            &[("component", component), ("location", &location)],
        )
        .await
    }

    async fn restore_component(
        &self,
        ctx: &CapabilityContext,
        component: &str,
        location: &Path,
    ) -> Result<()> {
        let location = location.display().to_string();
        self.mutate(
            ctx,
            "restoreComponent",
            &self.templates.restore_component,
            &[("component", component), ("location", &location)],
        )
        .await
    }

    async fn restart_device(&self, ctx: &CapabilityContext) -> Result<()> {
        info!(device = %ctx.device_id(), "Requesting device restart");
        self.mutate(ctx, "restartDevice", &self.templates.restart_device, &[])
            .await
    }

    async fn finalize(&self, ctx: &CapabilityContext) -> Result<()> {
        if self.templates.finalize.is_none() {
            return Ok(());
        }
        self.mutate(ctx, "finalize", &self.templates.finalize, &[]).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn complete_templates() -> CommandTemplates {
        CommandTemplates {
            source_management_present: Some("exit 1".to_string()),
            remove_source_management: Some("true".to_string()),
            prepare_target_enrollment: Some("true".to_string()),
            join_target_directory: Some("exit 75".to_string()),
            enroll_target_management: Some("exit 78".to_string()),
            verify_enrollment: Some("echo enrolled as {device}".to_string()),
            capture_component: Some("echo {component} > {location}".to_string()),
            restore_component: Some("exit 3".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_render() {
        assert_eq!(
            render("move {sourceSid} to {targetAccount} on {device}", &[
                ("device", "LAPTOP-042"),
                ("sourceSid", "S-1-5-21-7"),
                ("targetAccount", "AzureAD\\jdoe"),
            ]),
            "move 'S-1-5-21-7' to 'AzureAD\\jdoe' on 'LAPTOP-042'"
        );
        assert_eq!(render("no placeholders", &[("device", "x")]), "no placeholders");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(
            render("{device} {location} {other}", &[("device", "{location}"), ("location", "/b")]),
            "'{location}' '/b' {other}"
        );
    }

    async fn echo(template: &str, name: &str, value: &str) -> String {
        let ctx = CapabilityContext::new("LAPTOP-042");
        let output = run_line(&ctx, "echo", &render(template, &[(name, value)]))
            .await
            .unwrap();
        assert!(output.status.success());
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    #[tokio::test]
    async fn test_substituted_values_stay_literal() {
        assert_eq!(
            echo("printf '%s' {targetAccount}", "targetAccount", "AzureAD\\jdoe").await,
            "AzureAD\\jdoe"
        );
        assert_eq!(
            echo("echo {device}", "device", "PC-01; echo INJECTED").await,
            "PC-01; echo INJECTED\n"
        );
        assert_eq!(
            echo("printf '%s' {device}", "device", "it's $(id)").await,
            "it's $(id)"
        );
    }

    #[test]
    fn test_missing_templates() {
        assert!(CommandCapabilities::new(complete_templates())
            .missing_templates()
            .is_empty());

        let missing = CommandCapabilities::new(CommandTemplates::default()).missing_templates();
        assert_eq!(missing.len(), 8);
        assert_eq!(missing[0], "sourceManagementPresent");
    }

    #[tokio::test]
    async fn test_exit_codes_classify() {
        let caps = CommandCapabilities::new(complete_templates());
        let ctx = CapabilityContext::new("LAPTOP-042");

        assert!(!caps.source_management_present(&ctx).await.unwrap());
        assert!(caps.remove_source_management(&ctx).await.is_ok());
        assert_eq!(
            caps.join_target_directory(&ctx).await.unwrap_err().class(),
            ErrorClass::Transient
        );
        assert_eq!(
            caps.enroll_target_management(&ctx).await.unwrap_err().class(),
            ErrorClass::EnvironmentFatal
        );

        let dir = tempfile::tempdir().unwrap();
        let err = caps
            .restore_component(&ctx, "user-profile", dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::StepFailure);
    }

    #[tokio::test]
    async fn test_verify_enrollment_detail() {
        let caps = CommandCapabilities::new(complete_templates());
        let ctx = CapabilityContext::new("LAPTOP-042");
        let (enrolled, detail) = caps.verify_enrollment(&ctx).await.unwrap();
        assert!(enrolled);
        assert_eq!(detail, "enrolled as LAPTOP-042");
    }

    #[tokio::test]
    async fn test_capture_writes_location() {
        let caps = CommandCapabilities::new(complete_templates());
        let ctx = CapabilityContext::new("LAPTOP-042");
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("01-source-management");

        caps.capture_component(&ctx, "source-management", &location)
            .await
            .unwrap();
        let content = std::fs::read_to_string(&location).unwrap();
        assert_eq!(content.trim(), "source-management");
    }

    #[tokio::test]
    async fn test_preflight_reports_missing_templates() {
        let caps = CommandCapabilities::new(CommandTemplates::default());
        let ctx = CapabilityContext::new("LAPTOP-042");
        let err = caps.preflight(&ctx).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::EnvironmentFatal);
        assert!(err.to_string().contains("removeSourceManagement"));

        let mut templates = complete_templates();
        templates.preflight = Some("exit 1".to_string());
        let caps = CommandCapabilities::new(templates);
        assert_eq!(
            caps.preflight(&ctx).await.unwrap_err().class(),
            ErrorClass::EnvironmentFatal
        );
    }

    #[tokio::test]
    async fn test_discover_profile_parses_json() {
        let mut templates = complete_templates();
        templates.discover_profile = Some(
            r#"echo '{"sourceSid":"S-1-5-21-7","targetAccount":"jdoe@contoso.com"}'"#.to_string(),
        );
        let caps = CommandCapabilities::new(templates);
        let ctx = CapabilityContext::new("LAPTOP-042");

        let profile = caps.discover_profile(&ctx).await.unwrap().unwrap();
        assert_eq!(profile.source_sid, "S-1-5-21-7");

        let caps = CommandCapabilities::new(complete_templates());
        assert!(caps.discover_profile(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let mut templates = complete_templates();
        templates.prepare_target_enrollment = Some("sleep 5".to_string());
        let caps = CommandCapabilities::new(templates);
        let ctx = CapabilityContext::new("LAPTOP-042").with_timeout(Duration::from_millis(100));

        let err = caps.prepare_target_enrollment(&ctx).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Timeout { .. }));
        assert!(err.is_transient());
    }
}
