use std::error::Error;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

const OPERATOR_NAMESPACE: &str = "checkly-system";
const TEST_NAMESPACE: &str = "checkly-e2e";
const CHECK_NAME: &str = "e2e-health";
const INGRESS_NAME: &str = "e2e-web";
const DERIVED_CHECK_NAME: &str = "e2e-web-rule-0";

/// End-to-end test of the operator against a Kind cluster and a real
/// Checkly account:
///
/// 1. Start (or reuse) a Kind cluster and install the CRDs printed by `crdgen`.
/// 2. Deploy the operator with credentials from `CHECKLY_API_KEY` / `CHECKLY_ACCOUNT_ID`.
/// 3. Apply an ApiCheck and wait for `status.externalId` and `Ready=True`.
/// 4. Annotate an Ingress and wait for the derived ApiCheck to appear.
/// 5. Delete the Ingress and the ApiCheck and verify both checks are gone.
///
/// Run with: cargo test --test e2e_kind -- --ignored
#[test]
#[ignore]
fn e2e_checkly_operator_lifecycle() -> Result<(), Box<dyn Error>> {
    for tool in &["kind", "kubectl", "docker"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }
    let (Ok(api_key), Ok(account_id)) = (
        std::env::var("CHECKLY_API_KEY"),
        std::env::var("CHECKLY_ACCOUNT_ID"),
    ) else {
        eprintln!("Skipping e2e test: CHECKLY_API_KEY and CHECKLY_ACCOUNT_ID are required.");
        return Ok(());
    };

    let cluster_name =
        std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "checkly-e2e".into());
    ensure_kind_cluster(&cluster_name)?;

    // ── Install the CRDs ─────────────────────────────────────────────────────
    let crds = run_cmd(env!("CARGO_BIN_EXE_crdgen"), &[])?;
    kubectl_apply(&crds)?;

    // ── Deploy the operator ──────────────────────────────────────────────────
    let image =
        std::env::var("E2E_OPERATOR_IMAGE").unwrap_or_else(|_| "checkly-operator:e2e".into());
    if env_true("E2E_BUILD_IMAGE", true) {
        run_cmd("docker", &["build", "-t", &image, "."])?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run_cmd(
            "kind",
            &["load", "docker-image", &image, "--name", &cluster_name],
        )?;
    }

    let operator_yaml = operator_manifest(&image, &api_key, &account_id);
    let _cleanup = Cleanup {
        operator_manifest: operator_yaml.clone(),
    };

    for namespace in [OPERATOR_NAMESPACE, TEST_NAMESPACE] {
        run_cmd(
            "kubectl",
            &["create", "namespace", namespace, "--dry-run=client", "-o", "yaml"],
        )
        .and_then(|output| kubectl_apply(&output))?;
    }

    kubectl_apply(&operator_yaml)?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            "deployment/checkly-operator",
            "-n",
            OPERATOR_NAMESPACE,
            "--timeout=180s",
        ],
    )?;

    // ── Declared check ───────────────────────────────────────────────────────
    kubectl_apply(&api_check_manifest())?;
    wait_for("ApiCheck external id", Duration::from_secs(120), || {
        let id = jsonpath("apicheck", CHECK_NAME, "{.status.externalId}")?;
        Ok(!id.is_empty())
    })?;
    wait_for("ApiCheck Ready=True", Duration::from_secs(60), || {
        let ready = jsonpath(
            "apicheck",
            CHECK_NAME,
            "{.status.conditions[?(@.type==\"Ready\")].status}",
        )?;
        Ok(ready == "True")
    })?;
    let finalizers = jsonpath("apicheck", CHECK_NAME, "{.metadata.finalizers}")?;
    assert!(finalizers.contains("k8s.checklyhq.com/finalizer"));

    // ── Annotation-derived check ─────────────────────────────────────────────
    kubectl_apply(&ingress_manifest())?;
    wait_for("derived ApiCheck", Duration::from_secs(120), || {
        let id = jsonpath("apicheck", DERIVED_CHECK_NAME, "{.status.externalId}")
            .unwrap_or_default();
        Ok(!id.is_empty())
    })?;
    let endpoint = jsonpath("apicheck", DERIVED_CHECK_NAME, "{.spec.endpoint}")?;
    assert_eq!(endpoint, "https://e2e.example.com/health");

    run_cmd(
        "kubectl",
        &["delete", "ingress", INGRESS_NAME, "-n", TEST_NAMESPACE, "--wait=true"],
    )?;
    wait_for("derived ApiCheck removal", Duration::from_secs(120), || {
        Ok(!exists("apicheck", DERIVED_CHECK_NAME))
    })?;

    // ── Deletion releases the finalizer ──────────────────────────────────────
    run_cmd(
        "kubectl",
        &[
            "delete",
            "apicheck",
            CHECK_NAME,
            "-n",
            TEST_NAMESPACE,
            "--timeout=120s",
            "--wait=true",
        ],
    )?;
    assert!(!exists("apicheck", CHECK_NAME));

    Ok(())
}

fn jsonpath(kind: &str, name: &str, path: &str) -> Result<String, Box<dyn Error>> {
    run_cmd(
        "kubectl",
        &[
            "get",
            kind,
            name,
            "-n",
            TEST_NAMESPACE,
            "-o",
            &format!("jsonpath={}", path),
        ],
    )
}

fn exists(kind: &str, name: &str) -> bool {
    run_cmd(
        "kubectl",
        &["get", kind, name, "-n", TEST_NAMESPACE, "--ignore-not-found", "-o", "name"],
    )
    .map(|out| !out.is_empty())
    .unwrap_or(true)
}

fn api_check_manifest() -> String {
    format!(
        r#"apiVersion: k8s.checklyhq.com/v1alpha1
kind: ApiCheck
metadata:
  name: {CHECK_NAME}
  namespace: {TEST_NAMESPACE}
spec:
  endpoint: https://www.checklyhq.com
  success: "200"
  frequency: 10m
  muted: true
"#
    )
}

fn ingress_manifest() -> String {
    format!(
        r#"apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: {INGRESS_NAME}
  namespace: {TEST_NAMESPACE}
  annotations:
    k8s.checklyhq.com/check-url: https://e2e.example.com/health
    k8s.checklyhq.com/muted: "true"
spec:
  rules:
    - host: e2e.example.com
      http:
        paths:
          - path: /
            pathType: Prefix
            backend:
              service:
                name: web
                port:
                  number: 80
"#
    )
}

fn operator_manifest(image: &str, api_key: &str, account_id: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: checkly-operator
  namespace: {OPERATOR_NAMESPACE}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: checkly-operator
rules:
  - apiGroups: ["k8s.checklyhq.com"]
    resources: ["apichecks", "groups", "alertchannels"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: ["k8s.checklyhq.com"]
    resources: ["apichecks/status", "groups/status", "alertchannels/status"]
    verbs: ["get", "update", "patch"]
  - apiGroups: ["networking.k8s.io"]
    resources: ["ingresses"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["secrets"]
    verbs: ["get"]
  - apiGroups: [""]
    resources: ["events"]
    verbs: ["create"]
  - apiGroups: ["coordination.k8s.io"]
    resources: ["leases"]
    verbs: ["get", "create", "update", "patch"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: checkly-operator
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: checkly-operator
subjects:
  - kind: ServiceAccount
    name: checkly-operator
    namespace: {OPERATOR_NAMESPACE}
---
apiVersion: v1
kind: Secret
metadata:
  name: checkly-credentials
  namespace: {OPERATOR_NAMESPACE}
stringData:
  CHECKLY_API_KEY: "{api_key}"
  CHECKLY_ACCOUNT_ID: "{account_id}"
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: checkly-operator
  namespace: {OPERATOR_NAMESPACE}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: checkly-operator
  template:
    metadata:
      labels:
        app: checkly-operator
    spec:
      serviceAccountName: checkly-operator
      containers:
        - name: operator
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run", "--leader-elect", "--namespace", "{OPERATOR_NAMESPACE}"]
          envFrom:
            - secretRef:
                name: checkly-credentials
          ports:
            - containerPort: 8081
          readinessProbe:
            httpGet:
              path: /readyz
              port: 8081
          livenessProbe:
            httpGet:
              path: /healthz
              port: 8081
"#
    )
}

struct Cleanup {
    operator_manifest: String,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        // Let the operator release its finalizers before it goes away
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "delete",
                "apichecks",
                "--all",
                "-n",
                TEST_NAMESPACE,
                "--timeout=60s",
                "--wait=true",
            ],
        );
        let _ =
            run_cmd_with_stdin_quiet("kubectl", &["delete", "-f", "-"], &self.operator_manifest);
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "delete",
                "namespace",
                TEST_NAMESPACE,
                "--ignore-not-found=true",
            ],
        );
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "delete",
                "namespace",
                OPERATOR_NAMESPACE,
                "--ignore-not-found=true",
            ],
        );
    }
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)?;
    Ok(())
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let output = cmd.output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program, args, stdout, stderr
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
        stdin.flush()?;
        drop(stdin);
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program, args, stdout, stderr
        )
        .into());
    }
    Ok(())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}

fn env_true(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn run_cmd_quiet(program: &str, args: &[&str]) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let _ = cmd.output();
    Ok(())
}

fn run_cmd_with_stdin_quiet(
    program: &str,
    args: &[&str],
    input: &str,
) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        let _ = stdin.write_all(input.as_bytes());
        let _ = stdin.flush();
        drop(stdin);
    }
    let _ = child.wait_with_output();
    Ok(())
}
