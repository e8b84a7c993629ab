use crate::runner::report::{NodeReport, SuiteReport};

/// Emit run results as YAML.
pub fn emit_run_yaml(report: &SuiteReport) -> String {
    serde_yaml::to_string(report).unwrap_or_else(|e| format!("# Error serializing report: {e}"))
}

/// Emit run results as JSON.
pub fn emit_run_json(report: &SuiteReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{ \"error\": \"{e}\" }}"))
}

/// Split `pkg.mod.Case.test_x` into classname `pkg.mod.Case` and name
/// `test_x`. Per-test fixtures keep their test in the name.
fn junit_names<'a>(suite: &'a str, node: &'a NodeReport) -> (&'a str, &'a str) {
    let id = node.id.as_str();
    let split = if node.scope == "test" && node.kind != "test" {
        id.rsplit_once('.').and_then(|(head, _)| head.rsplit_once('.')).map(|(c, _)| c.len())
    } else {
        id.rsplit_once('.').map(|(c, _)| c.len())
    };
    match split {
        Some(at) => (&id[..at], &id[at + 1..]),
        None => (suite, id),
    }
}

/// Emit run results as JUnit XML. Fixtures are included as test cases so
/// that their failures are visible to CI.
pub fn emit_run_junit(report: &SuiteReport) -> String {
    let mut out = String::new();
    let name = xml_escape(&report.suite);
    let count = |status: &str| report.results.iter().filter(|r| r.status == status).count();
    let tests = report.results.len();
    let failures = count("failed");
    let errors = count("error") + count("failed-dependency");
    let skipped = count("skipped") + count("expected-failure");
    let time_secs = report.run.duration_ms as f64 / 1000.0;
    let totals = format!(
        "tests=\"{tests}\" failures=\"{failures}\" errors=\"{errors}\" \
         skipped=\"{skipped}\" time=\"{time_secs:.3}\""
    );

    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!("<testsuites name=\"{name}\" {totals}>\n"));
    out.push_str(&format!("  <testsuite name=\"{name}\" {totals}>\n"));

    for node in &report.results {
        let (classname, case) = junit_names(&report.suite, node);
        let node_time = node.duration_ms as f64 / 1000.0;
        out.push_str(&format!(
            "    <testcase name=\"{}\" classname=\"{}\" time=\"{node_time:.3}\">\n",
            xml_escape(case),
            xml_escape(classname)
        ));

        let message = node.error.as_ref().map(|e| xml_escape(&e.message));
        let kind = node.error.as_ref().map(|e| xml_escape(&e.kind));
        match node.status.as_str() {
            "failed" => out.push_str(&format!(
                "      <failure message=\"{}\" type=\"{}\"/>\n",
                message.as_deref().unwrap_or("test failed"),
                kind.as_deref().unwrap_or("assertion failed")
            )),
            "error" | "failed-dependency" => out.push_str(&format!(
                "      <error message=\"{}\" type=\"{}\"/>\n",
                message.as_deref().unwrap_or("execution error"),
                kind.as_deref().unwrap_or("unhandled error")
            )),
            "skipped" => out.push_str("      <skipped/>\n"),
            "expected-failure" => {
                out.push_str("      <skipped message=\"expected failure\"/>\n")
            }
            _ => {}
        }

        let mut stdout = node.stdout.clone().unwrap_or_default();
        for err in &node.teardown_errors {
            stdout.push_str(err);
            stdout.push('\n');
        }
        if !stdout.is_empty() {
            out.push_str(&format!("      <system-out>{}</system-out>\n", xml_escape(&stdout)));
        }
        if let Some(stderr) = &node.stderr {
            out.push_str(&format!("      <system-err>{}</system-err>\n", xml_escape(stderr)));
        }

        out.push_str("    </testcase>\n");
    }

    out.push_str("  </testsuite>\n");
    out.push_str("</testsuites>\n");
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
