use crate::error::{CollectError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A way of deploying the benchmarked workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    #[serde(alias = "docker")]
    Container,
    WasmInterpreted,
    WasmAot,
    Native,
}

/// The OS-level scope used to account a trial's resource usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationKind {
    Container,
    ControlGroup,
}

impl Mechanism {
    pub const ALL: [Mechanism; 4] = [
        Mechanism::Container,
        Mechanism::WasmInterpreted,
        Mechanism::WasmAot,
        Mechanism::Native,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::Container => "container",
            Mechanism::WasmInterpreted => "wasm_interpreted",
            Mechanism::WasmAot => "wasm_aot",
            Mechanism::Native => "native",
        }
    }

    pub fn isolation(self) -> IsolationKind {
        match self {
            Mechanism::Container => IsolationKind::Container,
            Mechanism::WasmInterpreted | Mechanism::WasmAot | Mechanism::Native => {
                IsolationKind::ControlGroup
            }
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(Mechanism::Container),
            "wasm_interpreted" => Ok(Mechanism::WasmInterpreted),
            "wasm_aot" => Ok(Mechanism::WasmAot),
            "native" => Ok(Mechanism::Native),
            other => Err(CollectError::config(format!(
                "unknown mechanism '{}' (choose from container, wasm_interpreted, wasm_aot, native)",
                other
            ))),
        }
    }
}

/// Parses a comma-separated mechanism list, keeping first-seen order and
/// dropping duplicates.
pub fn parse_mechanism_list(raw: &str) -> Result<Vec<Mechanism>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let mechanism: Mechanism = part.parse()?;
        if !out.contains(&mechanism) {
            out.push(mechanism);
        }
    }
    if out.is_empty() {
        return Err(CollectError::config("mechanism list is empty"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_is_accepted_as_container_alias() {
        assert_eq!("docker".parse::<Mechanism>().expect("alias"), Mechanism::Container);
        assert_eq!(
            " Wasm_AOT ".parse::<Mechanism>().expect("case-insensitive"),
            Mechanism::WasmAot
        );
    }

    #[test]
    fn mechanism_list_dedupes_and_keeps_order() {
        let parsed = parse_mechanism_list("native, docker,native,wasm_interpreted").expect("list");
        assert_eq!(
            parsed,
            vec![
                Mechanism::Native,
                Mechanism::Container,
                Mechanism::WasmInterpreted
            ]
        );
    }

    #[test]
    fn mechanism_list_rejects_unknown_and_empty() {
        let err = parse_mechanism_list("native,kvm").expect_err("unknown");
        assert!(err.to_string().contains("kvm"), "{}", err);
        assert!(parse_mechanism_list(" , ").is_err());
    }

    #[test]
    fn only_container_uses_container_isolation() {
        for m in Mechanism::ALL {
            let expected = if m == Mechanism::Container {
                IsolationKind::Container
            } else {
                IsolationKind::ControlGroup
            };
            assert_eq!(m.isolation(), expected);
        }
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let parsed: Vec<Mechanism> =
            serde_yaml::from_str("[docker, wasm_aot]").expect("yaml mechanisms");
        assert_eq!(parsed, vec![Mechanism::Container, Mechanism::WasmAot]);
        assert_eq!(
            serde_json::to_string(&Mechanism::WasmInterpreted).expect("json"),
            "\"wasm_interpreted\""
        );
    }
}
