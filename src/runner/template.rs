//! Command-line templates with `{placeholder}` substitution.
//!
//! `{{` and `}}` produce literal braces. Any other brace usage must name one of
//! [`PLACEHOLDERS`]; everything else is rejected when the configuration is
//! validated, so a typo never reaches a device.
//!
//! Templates run under `sh -c`, so substituted values are shell-quoted when
//! they contain anything beyond plain path characters. Write placeholders bare
//! (`--config {delegation_config}`), not wrapped in quotes of their own.

#![allow(missing_docs)]

use std::path::Path;

use crate::core::errors::{DvhError, Result};
use crate::fleet::device::{Channel, DeviceDescriptor, RemoteTarget};

/// Every placeholder a command template may reference.
pub const PLACEHOLDERS: &[&str] = &[
    "device_class",
    "machine",
    "delegation_config",
    "channel",
    "artifact",
    "remote_host",
    "remote_port",
    "remote_username",
    "report_dir",
];

/// Placeholders that only resolve for devices with a remote target.
pub const REMOTE_PLACEHOLDERS: &[&str] = &["remote_host", "remote_port", "remote_username"];

/// Values substituted into a template for one command of one device run.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub device: &'a DeviceDescriptor,
    /// Channel this command targets; the complement for resync commands.
    pub channel: Channel,
    pub artifact: &'a str,
    pub remote: Option<&'a RemoteTarget>,
    pub report_dir: &'a Path,
}

enum Piece<'t> {
    Literal(&'t str),
    Placeholder(&'t str),
}

fn parse(template: &str) -> Result<Vec<Piece<'_>>> {
    let err = |details: String| DvhError::Template {
        template: template.to_string(),
        details,
    };

    let mut pieces = Vec::new();
    let bytes = template.as_bytes();
    let mut literal_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                pieces.push(Piece::Literal(&template[literal_start..=i]));
                i += 2;
                literal_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                pieces.push(Piece::Literal(&template[literal_start..=i]));
                i += 2;
                literal_start = i;
            }
            b'{' => {
                let close = template[i + 1..]
                    .find('}')
                    .ok_or_else(|| err(format!("unterminated placeholder at byte {i}")))?;
                let name = &template[i + 1..i + 1 + close];
                if !PLACEHOLDERS.contains(&name) {
                    return Err(err(format!("unknown placeholder {{{name}}}")));
                }
                pieces.push(Piece::Literal(&template[literal_start..i]));
                pieces.push(Piece::Placeholder(name));
                i += close + 2;
                literal_start = i;
            }
            b'}' => return Err(err(format!("unmatched '}}' at byte {i}"))),
            _ => i += 1,
        }
    }
    pieces.push(Piece::Literal(&template[literal_start..]));
    Ok(pieces)
}

/// Check a template without expanding it.
pub fn validate(template: &str) -> Result<()> {
    parse(template).map(|_| ())
}

/// Names of the placeholders a template references, in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<&str>> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Placeholder(name) => Some(name),
            Piece::Literal(_) => None,
        })
        .collect())
}

/// Substitute `vars` into a command-line `template`, shell-quoting values.
pub fn expand(template: &str, vars: &TemplateVars<'_>) -> Result<String> {
    render(template, vars, true)
}

/// Substitute `vars` verbatim, for templates that name a path rather than a
/// command line.
pub fn expand_path(template: &str, vars: &TemplateVars<'_>) -> Result<String> {
    render(template, vars, false)
}

fn render(template: &str, vars: &TemplateVars<'_>, quote: bool) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 64);
    for piece in parse(template)? {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            Piece::Placeholder(name) => {
                let value = resolve(template, name, vars)?;
                if !quote {
                    out.push_str(&value);
                    continue;
                }
                let quoted = shlex::try_quote(&value).map_err(|err| DvhError::Template {
                    template: template.to_string(),
                    details: format!("{{{name}}} value {value:?} cannot be quoted: {err}"),
                })?;
                out.push_str(&quoted);
            }
        }
    }
    Ok(out)
}

fn resolve(template: &str, name: &str, vars: &TemplateVars<'_>) -> Result<String> {
    let remote = || {
        vars.remote.ok_or_else(|| DvhError::Template {
            template: template.to_string(),
            details: format!(
                "{{{name}}} used for device {} which has no remote target",
                vars.device.machine
            ),
        })
    };

    Ok(match name {
        "device_class" => vars.device.device_class.clone(),
        "machine" => vars.device.machine.clone(),
        "delegation_config" => vars.device.delegation_config.display().to_string(),
        "channel" => vars.channel.as_str().to_string(),
        "artifact" => vars.artifact.to_string(),
        "remote_host" => remote()?.host.clone(),
        "remote_port" => remote()?.port.to_string(),
        "remote_username" => remote()?.username.clone(),
        "report_dir" => vars.report_dir.display().to_string(),
        other => {
            return Err(DvhError::Template {
                template: template.to_string(),
                details: format!("unknown placeholder {{{other}}}"),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proptest::prelude::*;

    use super::*;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            device_class: "colibri-imx7".to_string(),
            machine: "colibri-02".to_string(),
            delegation_config: PathBuf::from("/etc/dvh/delegations/colibri.json"),
            channel: Channel::Release,
        }
    }

    #[test]
    fn expands_device_and_channel_fields() {
        let device = device();
        let remote = RemoteTarget {
            host: "10.0.0.7".to_string(),
            ..RemoteTarget::default()
        };
        let vars = TemplateVars {
            device: &device,
            channel: Channel::Nightly,
            artifact: "torizon/nightly-ref",
            remote: Some(&remote),
            report_dir: Path::new("reports/colibri"),
        };
        let out = expand(
            "tcb deploy --remote-host {remote_host} --remote-port {remote_port} \
             --remote-username {remote_username} --reboot {artifact} \
             # {channel} {delegation_config} {report_dir}",
            &vars,
        )
        .unwrap();
        assert_eq!(
            out,
            "tcb deploy --remote-host 10.0.0.7 --remote-port 22 --remote-username torizon \
             --reboot torizon/nightly-ref # nightly /etc/dvh/delegations/colibri.json \
             reports/colibri"
        );
    }

    #[test]
    fn doubled_braces_are_literal() {
        let device = device();
        let vars = TemplateVars {
            device: &device,
            channel: Channel::Release,
            artifact: "a",
            remote: None,
            report_dir: Path::new("r"),
        };
        let out = expand("awk '{{print $1}}' {machine}", &vars).unwrap();
        assert_eq!(out, "awk '{print $1}' colibri-02");
    }

    #[test]
    fn values_with_shell_metacharacters_stay_one_argument() {
        let mut device = device();
        device.delegation_config = PathBuf::from("/srv/trust policies/colibri;rm -rf x.json");
        let vars = TemplateVars {
            device: &device,
            channel: Channel::Release,
            artifact: "images/it's here.tar",
            remote: None,
            report_dir: Path::new("r"),
        };
        let line = expand("printf '%s\\n' {delegation_config} {artifact} {channel}", &vars).unwrap();
        assert!(line.ends_with(" release"), "{line}");
        let words = shlex::split(&line).expect("expanded line tokenizes");
        assert_eq!(
            words,
            vec![
                "printf",
                "%s\\n",
                "/srv/trust policies/colibri;rm -rf x.json",
                "images/it's here.tar",
                "release",
            ]
        );
    }

    #[test]
    fn path_expansion_keeps_values_verbatim() {
        let device = device();
        let vars = TemplateVars {
            device: &device,
            channel: Channel::Release,
            artifact: "a",
            remote: None,
            report_dir: Path::new("reports/run one"),
        };
        let out = expand_path("{report_dir}/{machine}.conf", &vars).unwrap();
        assert_eq!(out, "reports/run one/colibri-02.conf");
    }

    #[test]
    fn plain_values_are_left_unquoted() {
        let device = device();
        let vars = TemplateVars {
            device: &device,
            channel: Channel::Nightly,
            artifact: "torizon/nightly-ref",
            remote: None,
            report_dir: Path::new("reports/colibri"),
        };
        let out = expand("deploy {machine} {artifact} {report_dir}", &vars).unwrap();
        assert_eq!(out, "deploy colibri-02 torizon/nightly-ref reports/colibri");
    }

    #[test]
    fn unknown_and_malformed_placeholders_rejected() {
        for bad in ["deploy {mchine}", "deploy {machine", "deploy machine}", "{}"] {
            let err = validate(bad).expect_err(bad);
            assert_eq!(err.code(), "DVH-1102", "{bad}");
        }
    }

    #[test]
    fn remote_placeholder_without_remote_target_fails() {
        let device = device();
        let vars = TemplateVars {
            device: &device,
            channel: Channel::Release,
            artifact: "a",
            remote: None,
            report_dir: Path::new("r"),
        };
        let err = expand("ssh {remote_host}", &vars).unwrap_err();
        assert!(err.to_string().contains("no remote target"));
    }

    #[test]
    fn placeholders_lists_names_in_order() {
        let names = placeholders("{artifact} {{x}} {remote_host} {artifact}").unwrap();
        assert_eq!(names, vec!["artifact", "remote_host", "artifact"]);
    }

    proptest! {
        #[test]
        fn brace_free_text_expands_to_itself(text in "[^{}]{0,40}") {
            let device = device();
            let vars = TemplateVars {
                device: &device,
                channel: Channel::Release,
                artifact: "a",
                remote: None,
                report_dir: Path::new("r"),
            };
            prop_assert_eq!(expand(&text, &vars).unwrap(), text);
        }
    }
}
