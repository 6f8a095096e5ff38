//! Load balancer config compilation
//!
//! Templates use a small mustache-like syntax:
//!
//! ```text
//! frontend proxies
//!     bind *:{{listen_port}}
//!     default_backend fleet
//!
//! backend fleet
//! {{#backends}}
//!     server {{name}}{{id}} {{addr}}:{{port}} check
//! {{/backends}}
//! ```
//!
//! Top-level variables are `listen_port` and `backend_count`. Inside the
//! `backends` section each backend exposes `name`, `id`, `addr`, `port` and
//! `credential`. A section tag alone on its line leaves no blank line behind.

use crate::backend::BackendRecord;
use crate::error::CompileError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SECTION: &str = "backends";
const BACKEND_NAME: &str = "proxy";
const BACKEND_VARS: [&str; 5] = ["name", "id", "addr", "port", "credential"];

/// A rendered config and where it was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub path: PathBuf,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Text(&'a str),
    Var { name: &'a str, line: usize },
    Open { name: &'a str, line: usize },
    Close { name: &'a str, line: usize },
}

fn render_error(line: usize, message: impl Into<String>) -> CompileError {
    CompileError::TemplateRender {
        line,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token<'_>>, CompileError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut line = 1;

    while let Some(start) = rest.find("{{") {
        let (text, after) = rest.split_at(start);
        let tag_line = line + text.matches('\n').count();
        let Some(end) = after.find("}}") else {
            return Err(render_error(tag_line, "unterminated '{{'"));
        };
        let inner = after[2..end].trim();
        if inner.contains('\n') || inner.contains("{{") {
            return Err(render_error(tag_line, "unterminated '{{'"));
        }
        let mut remainder = &after[end + 2..];

        let tag = if let Some(name) = inner.strip_prefix('#') {
            Token::Open { name: name.trim(), line: tag_line }
        } else if let Some(name) = inner.strip_prefix('/') {
            Token::Close { name: name.trim(), line: tag_line }
        } else if inner.is_empty() {
            return Err(render_error(tag_line, "empty tag"));
        } else {
            Token::Var { name: inner, line: tag_line }
        };

        let mut text = text;
        if matches!(tag, Token::Open { .. } | Token::Close { .. }) {
            // Standalone section tags swallow their indentation and newline
            let line_start = text.rfind('\n').map(|i| i + 1).unwrap_or(0);
            let indent = &text[line_start..];
            let newline = if remainder.starts_with("\r\n") {
                Some(2)
            } else if remainder.starts_with('\n') {
                Some(1)
            } else if remainder.is_empty() {
                Some(0)
            } else {
                None
            };
            if let (true, Some(skip)) = (indent.trim().is_empty(), newline) {
                text = &text[..line_start];
                remainder = &remainder[skip..];
                line += usize::from(skip > 0);
            }
        }

        if !text.is_empty() {
            tokens.push(Token::Text(text));
        }
        tokens.push(tag);

        line += text.matches('\n').count();
        line += after[..end + 2].matches('\n').count();
        rest = remainder;
    }

    if !rest.is_empty() {
        tokens.push(Token::Text(rest));
    }
    Ok(tokens)
}

fn top_level_var(name: &str, listen_port: u16, backend_count: usize) -> Option<String> {
    match name {
        "listen_port" => Some(listen_port.to_string()),
        "backend_count" => Some(backend_count.to_string()),
        _ => None,
    }
}

fn backend_var(name: &str, backend: &BackendRecord) -> Option<String> {
    match name {
        "name" => Some(BACKEND_NAME.to_string()),
        "id" => Some(backend.id.clone()),
        "addr" => Some(backend.address.clone()),
        "port" => Some(backend.port.to_string()),
        "credential" => Some(backend.encoded_credential.clone()),
        _ => None,
    }
}

/// Render `template` for `backends`, in their order
pub fn render(
    template: &str,
    backends: &[BackendRecord],
    listen_port: u16,
) -> Result<String, CompileError> {
    let tokens = tokenize(template)?;
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < tokens.len() {
        match tokens[i] {
            Token::Text(text) => out.push_str(text),
            Token::Var { name, line } => {
                let value = top_level_var(name, listen_port, backends.len())
                    .ok_or_else(|| render_error(line, format!("unknown variable '{}'", name)))?;
                out.push_str(&value);
            }
            Token::Open { name, line } => {
                if name != SECTION {
                    return Err(render_error(line, format!("unknown section '{}'", name)));
                }
                let body_start = i + 1;
                let mut body_end = None;
                for (j, token) in tokens.iter().enumerate().skip(body_start) {
                    match token {
                        Token::Open { line, .. } => {
                            return Err(render_error(*line, "sections cannot be nested"));
                        }
                        Token::Close { name: close, line } if *close != SECTION => {
                            return Err(render_error(
                                *line,
                                format!("'{{{{/{}}}}}' does not match '{{{{#{}}}}}'", close, SECTION),
                            ));
                        }
                        Token::Close { .. } => {
                            body_end = Some(j);
                            break;
                        }
                        _ => {}
                    }
                }
                let body_end = body_end
                    .ok_or_else(|| render_error(line, format!("unclosed section '{}'", name)))?;

                for backend in backends {
                    for token in &tokens[body_start..body_end] {
                        match token {
                            Token::Text(text) => out.push_str(text),
                            Token::Var { name, line } => {
                                let value = backend_var(name, backend)
                                    .or_else(|| top_level_var(name, listen_port, backends.len()))
                                    .ok_or_else(|| {
                                        render_error(*line, format!("unknown variable '{}'", name))
                                    })?;
                                out.push_str(&value);
                            }
                            Token::Open { .. } | Token::Close { .. } => {}
                        }
                    }
                }
                // Validate the body even when there are no backends to render
                if backends.is_empty() {
                    for token in &tokens[body_start..body_end] {
                        if let Token::Var { name, line } = token {
                            if !BACKEND_VARS.contains(name)
                                && top_level_var(name, listen_port, 0).is_none()
                            {
                                return Err(render_error(
                                    *line,
                                    format!("unknown variable '{}'", name),
                                ));
                            }
                        }
                    }
                }
                i = body_end;
            }
            Token::Close { name, line } => {
                return Err(render_error(line, format!("unexpected '{{{{/{}}}}}'", name)));
            }
        }
        i += 1;
    }

    Ok(out)
}

/// Renders the load balancer config from a template file.
///
/// Stateless: every call re-reads the template and renders the full backend
/// set. The target is replaced atomically so readers never see a partial file.
#[derive(Debug, Clone)]
pub struct ConfigCompiler {
    template_path: PathBuf,
    target_path: PathBuf,
    listen_port: u16,
}

impl ConfigCompiler {
    pub fn new(
        template_path: impl Into<PathBuf>,
        target_path: impl Into<PathBuf>,
        listen_port: u16,
    ) -> Self {
        Self {
            template_path: template_path.into(),
            target_path: target_path.into(),
            listen_port,
        }
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    pub fn compile(&self, backends: &[BackendRecord]) -> Result<ConfigArtifact, CompileError> {
        let template = std::fs::read_to_string(&self.template_path).map_err(|source| {
            CompileError::TemplateRead {
                path: self.template_path.clone(),
                source,
            }
        })?;

        let contents = render(&template, backends, self.listen_port)?;
        self.write_atomic(&contents)?;

        info!(
            path = %self.target_path.display(),
            backends = backends.len(),
            "Load balancer config compiled"
        );
        debug!(bytes = contents.len(), "Config contents written");

        Ok(ConfigArtifact {
            path: self.target_path.clone(),
            contents,
        })
    }

    fn write_atomic(&self, contents: &str) -> Result<(), CompileError> {
        let write_error = |source| CompileError::ConfigWrite {
            path: self.target_path.clone(),
            source,
        };

        let dir = self
            .target_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
        file.write_all(contents.as_bytes()).map_err(write_error)?;
        file.as_file().sync_all().map_err(write_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))
                .map_err(write_error)?;
        }

        file.persist(&self.target_path)
            .map_err(|e| write_error(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEMPLATE: &str = "\
frontend proxies
    bind *:{{listen_port}}
    default_backend fleet

backend fleet
    {{#backends}}
    server {{name}}{{id}} {{addr}}:{{port}} check
    {{/backends}}
";

    fn records() -> Vec<BackendRecord> {
        vec![
            BackendRecord::new("1", "10.0.0.1", 8080),
            BackendRecord::new("2", "10.0.0.2", 8080),
            BackendRecord::new("3", "10.0.0.3", 3128),
        ]
    }

    fn server_lines(rendered: &str) -> Vec<&str> {
        rendered
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("server "))
            .collect()
    }

    fn write_template(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("haproxy.cfg.tmpl");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_render_one_entry_per_backend_in_order() {
        let rendered = render(TEMPLATE, &records(), 5566).unwrap();

        assert_eq!(
            server_lines(&rendered),
            vec![
                "server proxy1 10.0.0.1:8080 check",
                "server proxy2 10.0.0.2:8080 check",
                "server proxy3 10.0.0.3:3128 check",
            ]
        );
        assert!(rendered.contains("bind *:5566"));
    }

    #[test]
    fn test_render_reversed_order_follows_input() {
        let mut backends = records();
        backends.reverse();
        let rendered = render(TEMPLATE, &backends, 5566).unwrap();

        let ids: Vec<_> = server_lines(&rendered)
            .iter()
            .map(|l| l.split_whitespace().nth(1).unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["proxy3", "proxy2", "proxy1"]);
    }

    #[test]
    fn test_render_standalone_tags_leave_no_blank_lines() {
        let rendered = render(TEMPLATE, &records()[..1], 5566).unwrap();
        assert_eq!(
            rendered,
            "\
frontend proxies
    bind *:5566
    default_backend fleet

backend fleet
    server proxy1 10.0.0.1:8080 check
"
        );
    }

    #[test]
    fn test_render_empty_backend_set() {
        let rendered = render(TEMPLATE, &[], 5566).unwrap();
        assert!(server_lines(&rendered).is_empty());
        assert!(rendered.ends_with("backend fleet\n"));
    }

    #[test]
    fn test_render_inline_section_and_credentials() {
        let backends = vec![BackendRecord::new("9", "10.0.0.9", 80)
            .with_credentials("user", "pass")
            .unwrap()];
        let template = "count={{backend_count}} [{{#backends}}{{id}}:{{credential}};{{/backends}}]";

        let rendered = render(template, &backends, 1).unwrap();
        assert_eq!(rendered, "count=1 [9:dXNlcjpwYXNz;]");
    }

    #[test]
    fn test_render_unknown_variable_reports_line() {
        let err = render("line one\n{{nope}}\n", &records(), 1).unwrap_err();
        match err {
            CompileError::TemplateRender { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_render_unknown_variable_in_empty_section() {
        let err = render("{{#backends}}\n{{bogus}}\n{{/backends}}\n", &[], 1).unwrap_err();
        assert!(matches!(err, CompileError::TemplateRender { line: 2, .. }));
    }

    #[test]
    fn test_render_structural_errors() {
        let cases = [
            ("{{#backends}}\nserver {{id}}\n", "unclosed"),
            ("{{/backends}}\n", "unexpected"),
            ("{{#backends}}{{#backends}}{{/backends}}{{/backends}}", "nested"),
            ("{{#servers}}{{/servers}}", "unknown section"),
            ("{{#backends}}{{/servers}}", "does not match"),
            ("bind {{listen_port\n", "unterminated"),
            ("{{}}", "empty tag"),
        ];

        for (template, expected) in cases {
            let err = render(template, &records(), 1).unwrap_err().to_string();
            assert!(
                err.contains(expected),
                "template {:?}: expected '{}' in '{}'",
                template,
                expected,
                err
            );
        }
    }

    #[test]
    fn test_render_tracks_lines_after_sections() {
        let template = "a\n{{#backends}}\n{{id}}\n{{/backends}}\nb\n{{missing}}\n";
        let err = render(template, &records(), 1).unwrap_err();
        assert!(matches!(err, CompileError::TemplateRender { line: 6, .. }));
    }

    #[test]
    fn test_compile_writes_target() {
        let dir = TempDir::new().unwrap();
        let template = write_template(&dir, TEMPLATE);
        let target = dir.path().join("haproxy.cfg");
        let compiler = ConfigCompiler::new(&template, &target, 5566);

        let artifact = compiler.compile(&records()).unwrap();

        assert_eq!(artifact.path, target);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), artifact.contents);
        assert_eq!(server_lines(&artifact.contents).len(), 3);
    }

    #[test]
    fn test_compile_rerenders_full_set_each_time() {
        let dir = TempDir::new().unwrap();
        let template = write_template(&dir, TEMPLATE);
        let target = dir.path().join("haproxy.cfg");
        let compiler = ConfigCompiler::new(&template, &target, 5566);

        compiler.compile(&records()).unwrap();
        let artifact = compiler.compile(&records()[..1]).unwrap();

        let on_disk = std::fs::read_to_string(&target).unwrap();
        assert_eq!(on_disk, artifact.contents);
        assert_eq!(server_lines(&on_disk), vec!["server proxy1 10.0.0.1:8080 check"]);

        // Only the target is left behind, no temp files
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 2);
    }

    #[test]
    fn test_compile_missing_template() {
        let dir = TempDir::new().unwrap();
        let compiler = ConfigCompiler::new(
            dir.path().join("missing.tmpl"),
            dir.path().join("haproxy.cfg"),
            5566,
        );

        let err = compiler.compile(&records()).unwrap_err();
        assert!(matches!(err, CompileError::TemplateRead { .. }));
        assert!(!dir.path().join("haproxy.cfg").exists());
    }

    #[test]
    fn test_compile_unwritable_target() {
        let dir = TempDir::new().unwrap();
        let template = write_template(&dir, TEMPLATE);
        let compiler =
            ConfigCompiler::new(&template, dir.path().join("no/such/dir/haproxy.cfg"), 5566);

        let err = compiler.compile(&records()).unwrap_err();
        assert!(matches!(err, CompileError::ConfigWrite { .. }));
    }

    #[test]
    fn test_compile_render_error_keeps_previous_config() {
        let dir = TempDir::new().unwrap();
        let template = write_template(&dir, TEMPLATE);
        let target = dir.path().join("haproxy.cfg");
        let compiler = ConfigCompiler::new(&template, &target, 5566);
        let first = compiler.compile(&records()).unwrap();

        std::fs::write(&template, "{{#backends}}").unwrap();
        assert!(compiler.compile(&records()).is_err());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), first.contents);
    }

    #[test]
    fn test_bundled_template_renders() {
        let template = include_str!("../haproxy.cfg.tmpl");
        let backends = vec![BackendRecord::new("1", "10.0.0.1", 8080)
            .with_credentials("user", "pass")
            .unwrap()];
        let rendered = render(template, &backends, 5566).unwrap();
        assert!(rendered.contains("10.0.0.1:8080"));
    }
}
