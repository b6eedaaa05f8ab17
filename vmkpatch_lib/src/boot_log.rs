//! Decides whether a serial console capture shows a patched vmkernel
//! booting all the way to the management interface.

use std::{fs, path::Path};

use regex::Regex;

use crate::Result;

/// A named pattern searched for anywhere in the normalized log.
pub struct Marker {
    pub name: &'static str,
    pattern: Regex,
}

impl Marker {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).expect("regex compile error"),
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// The marker sets a boot log is checked against.
pub struct Rules {
    /// Every one of these must appear.
    pub required: Vec<Marker>,
    /// Any of these is fatal.
    pub panic: Vec<Marker>,
    /// Reported when present, never required.
    pub strong: Vec<Marker>,
    /// Panic marker that may be tolerated when it is the only panic hit.
    pub generic_panic: &'static str,
}

impl Rules {
    pub fn esxi8() -> Self {
        Self {
            required: vec![
                Marker::new("uefi_boot_path", r"BdsDxe: (loading|starting) Boot\d+"),
                Marker::new("vmkernel_boot", r"Starting VMKernel"),
                Marker::new("boot_complete", r"Boot complete \(2/2\)"),
                Marker::new(
                    "dcui_or_management",
                    r"(Starting service DCUI|To manage this host, go to:)",
                ),
            ],
            panic: vec![
                Marker::new("panic_its_2934", r"its\.c:2934"),
                Marker::new("panic_module", r"Module\(s\) involved in panic"),
                Marker::new("kernel_verify", r"\bVERIFY\b"),
            ],
            strong: vec![Marker::new(
                "vmware_boot_entry",
                r#"Boot\d+\s+"VMware ESXi""#,
            )],
            generic_panic: "kernel_verify",
        }
    }

    /// Classifies normalized log text. With `allow_generic_panic` the
    /// generic panic marker is ignored, but only when nothing else matched.
    pub fn check(&self, text: &str, allow_generic_panic: bool) -> Verdict {
        let missing = names(self.required.iter().filter(|m| !m.is_match(text)));
        let mut panic_hits = names(self.panic.iter().filter(|m| m.is_match(text)));
        let strong_hits = names(self.strong.iter().filter(|m| m.is_match(text)));

        if allow_generic_panic && panic_hits == [self.generic_panic] {
            panic_hits.clear();
        }

        if !missing.is_empty() {
            Verdict::MissingRequired(missing)
        } else if !panic_hits.is_empty() {
            Verdict::Panic(panic_hits)
        } else {
            Verdict::Pass {
                markers: names(self.required.iter()),
                strong: strong_hits,
            }
        }
    }
}

fn names<'a>(markers: impl Iterator<Item = &'a Marker>) -> Vec<&'static str> {
    markers.map(|marker| marker.name).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass {
        markers: Vec<&'static str>,
        strong: Vec<&'static str>,
    },
    MissingRequired(Vec<&'static str>),
    Panic(Vec<&'static str>),
}

impl Verdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Pass { .. } => 0,
            Verdict::MissingRequired(_) => 3,
            Verdict::Panic(_) => 4,
        }
    }

    /// The lines printed for an operator.
    pub fn report(&self) -> String {
        match self {
            Verdict::Pass { markers, strong } => {
                let strong = if strong.is_empty() {
                    "none (acceptable; firmware may boot via generic UEFI entry)".to_string()
                } else {
                    strong.join(", ")
                };
                format!(
                    "RESULT: PASS\nMarkers: {}\nStrong markers: {}\n",
                    markers.join(", "),
                    strong
                )
            }
            Verdict::MissingRequired(missing) => format!(
                "RESULT: FAIL (missing required boot markers)\nMissing: {}\n",
                missing.join(", ")
            ),
            Verdict::Panic(hits) => format!(
                "RESULT: FAIL (panic signature detected)\nPanic markers: {}\n",
                hits.join(", ")
            ),
        }
    }
}

/// Strips terminal escape sequences, unifies line endings on `\n`, and keeps
/// only printable ASCII, newlines and tabs.
pub fn normalize(raw: &str) -> String {
    let osc = Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").expect("regex compile error");
    let csi = Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").expect("regex compile error");

    let text = osc.replace_all(raw, "");
    let text = csi.replace_all(&text, "");
    let text = text.replace("\r\n", "\n").replace('\r', "\n");

    text.chars()
        .filter(|c| matches!(c, '\n' | '\t' | ' '..='~'))
        .collect()
}

/// Reads and normalizes a serial log. Bytes that are not valid UTF-8 are
/// dropped along with the rest of the non ASCII text.
pub fn read_log(path: &Path) -> Result<String> {
    let raw = fs::read(path)?;
    Ok(normalize(&String::from_utf8_lossy(&raw)))
}
