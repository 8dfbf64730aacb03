//! Built-in task kinds
//!
//! These mirror the catalog tasks a typical clone/lint/test/build/deploy
//! pipeline references. Scripts read their inputs from environment variables
//! and never have parameter values spliced into their text, so a value is
//! never evaluated by the shell. The scripts also avoid shell `$(...)`
//! command substitution, which would collide with reference syntax.

use super::{ExecutableUnitDescriptor, TaskKind};
use crate::core::params::ParameterSpec;
use std::collections::BTreeMap;

pub fn descriptors() -> Vec<ExecutableUnitDescriptor> {
    vec![git_clone(), flake8(), nose(), buildah(), openshift_client()]
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn env(vars: &[(&str, &str)]) -> BTreeMap<String, String> {
    vars.iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn git_clone() -> ExecutableUnitDescriptor {
    ExecutableUnitDescriptor {
        kind: TaskKind::GitClone,
        description: Some("Clone a git repository into the output workspace".to_string()),
        image: Some("gcr.io/tekton-releases/git-init".to_string()),
        params: vec![
            ParameterSpec::required("url"),
            ParameterSpec::required("revision").with_default("main"),
            ParameterSpec::required("subdirectory").with_default(""),
            ParameterSpec::required("deleteExisting").with_default("true"),
            ParameterSpec::required("depth").with_default("1"),
        ],
        workspaces: vec!["output".to_string()],
        results: vec!["commit".to_string(), "url".to_string()],
        command: sh(r#"set -e
case "/$SUBDIRECTORY/" in
  */../*) echo "subdirectory must stay inside the output workspace" >&2; exit 1 ;;
esac
CHECKOUT_DIR="$OUTPUT_PATH/$SUBDIRECTORY"
if [ "$DELETE_EXISTING" = "true" ] && [ -d "$CHECKOUT_DIR" ]; then
  find "$CHECKOUT_DIR" -mindepth 1 -delete
fi
git clone --depth "$DEPTH" --branch "$REVISION" -- "$URL" "$CHECKOUT_DIR"
git -C "$CHECKOUT_DIR" rev-parse HEAD | tr -d '\n' > "$COMMIT_RESULT"
printf '%s' "$URL" > "$URL_RESULT"
"#),
        working_dir: None,
        env: env(&[
            ("URL", "$(params.url)"),
            ("REVISION", "$(params.revision)"),
            ("SUBDIRECTORY", "$(params.subdirectory)"),
            ("DELETE_EXISTING", "$(params.deleteExisting)"),
            ("DEPTH", "$(params.depth)"),
            ("OUTPUT_PATH", "$(workspaces.output.path)"),
            ("COMMIT_RESULT", "$(results.commit.path)"),
            ("URL_RESULT", "$(results.url.path)"),
        ]),
    }
}

fn flake8() -> ExecutableUnitDescriptor {
    ExecutableUnitDescriptor {
        kind: TaskKind::Flake8,
        description: Some("Lint Python sources with flake8".to_string()),
        image: Some("python:3.9-slim".to_string()),
        params: vec![
            ParameterSpec::required("args").with_default(vec![
                "--count".to_string(),
                "--max-complexity=10".to_string(),
                "--max-line-length=127".to_string(),
                "--statistics".to_string(),
            ]),
            ParameterSpec::required("path").with_default("."),
        ],
        workspaces: vec!["source".to_string()],
        results: Vec::new(),
        command: vec![
            "flake8".to_string(),
            "$(params.args[*])".to_string(),
            "$(params.path)".to_string(),
        ],
        working_dir: Some("$(workspaces.source.path)".to_string()),
        env: BTreeMap::new(),
    }
}

fn nose() -> ExecutableUnitDescriptor {
    ExecutableUnitDescriptor {
        kind: TaskKind::Nose,
        description: Some("Run Python unit tests with nose".to_string()),
        image: Some("python:3.9-slim".to_string()),
        params: vec![
            ParameterSpec::required("args").with_default("-v"),
            ParameterSpec::required("requirements").with_default("requirements.txt"),
        ],
        workspaces: vec!["source".to_string()],
        results: Vec::new(),
        command: sh(r#"set -ef
if [ -f "$REQUIREMENTS" ]; then
  python -m pip install -r "$REQUIREMENTS"
fi
# NOSE_ARGS is split into words on purpose
nosetests $NOSE_ARGS
"#),
        working_dir: Some("$(workspaces.source.path)".to_string()),
        env: env(&[
            ("NOSE_ARGS", "$(params.args)"),
            ("REQUIREMENTS", "$(params.requirements)"),
        ]),
    }
}

fn buildah() -> ExecutableUnitDescriptor {
    ExecutableUnitDescriptor {
        kind: TaskKind::Buildah,
        description: Some("Build an image from a Dockerfile and push it".to_string()),
        image: Some("quay.io/buildah/stable".to_string()),
        params: vec![
            ParameterSpec::required("IMAGE"),
            ParameterSpec::required("DOCKERFILE").with_default("./Dockerfile"),
            ParameterSpec::required("CONTEXT").with_default("."),
            ParameterSpec::required("TLSVERIFY").with_default("true"),
        ],
        workspaces: vec!["source".to_string()],
        results: vec!["IMAGE_DIGEST".to_string()],
        command: sh(r#"set -e
buildah bud --tls-verify="$TLSVERIFY" -f "$DOCKERFILE" -t "$IMAGE" "$CONTEXT"
buildah push --tls-verify="$TLSVERIFY" --digestfile "$DIGEST_RESULT" "$IMAGE"
"#),
        working_dir: Some("$(workspaces.source.path)".to_string()),
        env: env(&[
            ("IMAGE", "$(params.IMAGE)"),
            ("DOCKERFILE", "$(params.DOCKERFILE)"),
            ("CONTEXT", "$(params.CONTEXT)"),
            ("TLSVERIFY", "$(params.TLSVERIFY)"),
            ("DIGEST_RESULT", "$(results.IMAGE_DIGEST.path)"),
        ]),
    }
}

/// `SCRIPT` is shell code by definition and is run as given
fn openshift_client() -> ExecutableUnitDescriptor {
    ExecutableUnitDescriptor {
        kind: TaskKind::OpenshiftClient,
        description: Some("Run a script with the OpenShift CLI available".to_string()),
        image: Some("quay.io/openshift/origin-cli".to_string()),
        params: vec![ParameterSpec::required("SCRIPT").with_default("oc help")],
        workspaces: Vec::new(),
        results: Vec::new(),
        command: sh("$(params.SCRIPT)"),
        working_dir: None,
        env: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_take_inputs_from_env() {
        for descriptor in descriptors() {
            if descriptor.kind == TaskKind::OpenshiftClient || descriptor.command[0] != "sh" {
                continue;
            }
            let script = &descriptor.command[2];
            assert!(
                !script.contains("$(params.") && !script.contains("$(results."),
                "{} splices references into its script",
                descriptor.kind
            );
            for param in &descriptor.params {
                let reference = format!("$(params.{})", param.name);
                assert!(
                    descriptor.env.values().any(|v| *v == reference),
                    "{} does not pass {} through env",
                    descriptor.kind,
                    param.name
                );
            }
        }
    }
}
