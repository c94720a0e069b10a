//! Interpreter initialization payload
//!
//! The payload defines the in-namespace dispatcher that decodes a
//! submission, executes it with interactive-shell display semantics and
//! reports exceptions on stderr. It ends by printing a readiness sentinel.
//! The whole script travels base64-encoded on one line: the interactive
//! loop would otherwise end the function body at the first blank line.

use crate::codec::{encode_payload, python_str_literal, Sentinel};
use std::path::Path;

/// Name of the dispatcher function installed in `__main__`
pub const DISPATCH_FN: &str = "__pyrepl_dispatch";

/// Name of the stream barrier function installed in `__main__`
pub const BARRIER_FN: &str = "__pyrepl_barrier";

/// Readiness sentinel prefix
pub const READY_PREFIX: &str = "__PYREPL_READY_";

const DISPATCHER_SOURCE: &str = r#"
import ast as __pyrepl_ast
import base64 as __pyrepl_b64
import sys as __pyrepl_sys
import traceback as __pyrepl_tb

def __pyrepl_dispatch(payload):
    try:
        code = __pyrepl_b64.b64decode(payload).decode("utf-8").strip()
        if not code:
            return
        tree = __pyrepl_ast.parse(code, "<repl>", "exec")
        if not tree.body:
            return
        last = tree.body[-1]
        if isinstance(last, __pyrepl_ast.Expr):
            if len(tree.body) > 1:
                head = __pyrepl_ast.Module(body=tree.body[:-1], type_ignores=[])
                exec(compile(head, "<repl>", "exec"), globals())
            value = eval(compile(__pyrepl_ast.Expression(body=last.value), "<repl>", "eval"), globals())
            if value is not None:
                print(repr(value))
        else:
            exec(compile(tree, "<repl>", "exec"), globals())
    except (Exception, KeyboardInterrupt):
        __pyrepl_tb.print_exc(file=__pyrepl_sys.stderr)
    finally:
        __pyrepl_sys.stderr.flush()
        __pyrepl_sys.stdout.flush()

def __pyrepl_barrier(token):
    __pyrepl_sys.stderr.write(token + "\n")
    __pyrepl_sys.stderr.flush()
    print(token, flush=True)
"#;

/// One-time initialization handshake for a freshly spawned interpreter
#[derive(Debug, Clone)]
pub struct Bootstrap {
    ready: Sentinel,
    script: String,
}

impl Bootstrap {
    /// Build the payload, seeding `PROJECT_ROOT` and `WORKSPACE`
    #[must_use]
    pub fn new(project_root: &Path, workspace: &Path) -> Self {
        let ready = Sentinel::with_prefix(READY_PREFIX);
        let script = format!(
            "{DISPATCHER_SOURCE}\nPROJECT_ROOT = {}\nWORKSPACE = {}\nprint({})\n",
            python_str_literal(&project_root.to_string_lossy()),
            python_str_literal(&workspace.to_string_lossy()),
            python_str_literal(ready.as_str()),
        );
        Self { ready, script }
    }

    /// Readiness sentinel printed as the payload's last action
    #[must_use]
    pub fn ready_sentinel(&self) -> &Sentinel {
        &self.ready
    }

    /// The decoded Python source
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Single newline-terminated line to write to the interpreter's stdin
    #[must_use]
    pub fn install_line(&self) -> String {
        format!(
            "exec(__import__(\"base64\").b64decode(\"{}\").decode(\"utf-8\"))\n",
            encode_payload(&self.script)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn install_line_is_single_line() {
        let boot = Bootstrap::new(Path::new("/proj"), Path::new("/proj/.pyrepl/workspace"));
        let line = boot.install_line();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.starts_with("exec(__import__(\"base64\")"));
    }

    #[test]
    fn payload_defines_dispatcher_and_seeds_paths() {
        let boot = Bootstrap::new(Path::new("/tmp/fake/root"), Path::new("/tmp/ws"));
        let script = boot.script();
        assert!(script.contains(&format!("def {DISPATCH_FN}(payload):")));
        assert!(script.contains(&format!("def {BARRIER_FN}(token):")));
        assert!(script.contains("PROJECT_ROOT = \"/tmp/fake/root\""));
        assert!(script.contains("WORKSPACE = \"/tmp/ws\""));
        assert!(script.trim_end().ends_with(&format!("print(\"{}\")", boot.ready_sentinel().as_str())));
    }

    #[test]
    fn encoded_script_round_trips() {
        let boot = Bootstrap::new(Path::new("/a"), Path::new("/b"));
        let line = boot.install_line();
        let start = line.find("b64decode(\"").unwrap() + "b64decode(\"".len();
        let end = start + line[start..].find('"').unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&line[start..end])
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), boot.script());
    }

    #[test]
    fn ready_sentinels_differ_per_bootstrap() {
        let a = Bootstrap::new(Path::new("/a"), Path::new("/b"));
        let b = Bootstrap::new(Path::new("/a"), Path::new("/b"));
        assert_ne!(a.ready_sentinel(), b.ready_sentinel());
        assert!(a.ready_sentinel().as_str().starts_with(READY_PREFIX));
    }
}
