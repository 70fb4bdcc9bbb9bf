use clap::ValueEnum;
use tabled::{Table, Tabled};

use crate::api::Vm;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "VMID")]
    vmid: u32,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "VCPUS")]
    vcpus: String,
    #[tabled(rename = "MEMORY")]
    memory: String,
}

impl From<&Vm> for VmRow {
    fn from(vm: &Vm) -> Self {
        Self {
            vmid: vm.vmid,
            name: vm.name.clone(),
            status: vm.status.to_string(),
            vcpus: vm.boot_vcpus.map(|v| v.to_string()).unwrap_or_default(),
            memory: vm.memory_size.map(format_bytes).unwrap_or_default(),
        }
    }
}

fn format_bytes(bytes: i64) -> String {
    const MIB: i64 = 1024 * 1024;
    const GIB: i64 = 1024 * MIB;
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else {
        format!("{}M", bytes / MIB)
    }
}

pub fn render_vms(vms: &[Vm], format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Table => Table::new(vms.iter().map(VmRow::from)).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(vms)?,
        OutputFormat::Yaml => serde_yaml::to_string(vms)?,
    })
}

pub fn render_vm(vm: &Vm, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Table => Table::new([VmRow::from(vm)]).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(vm)?,
        OutputFormat::Yaml => serde_yaml::to_string(vm)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::VmStatus;

    fn vm() -> Vm {
        Vm {
            vmid: 100,
            name: "web01".to_string(),
            status: VmStatus::Running,
            boot_vcpus: Some(2),
            memory_size: Some(2 * 1024 * 1024 * 1024),
        }
    }

    #[test]
    fn table_has_headers_and_values() {
        let table = render_vms(&[vm()], OutputFormat::Table).unwrap();
        assert!(table.contains("VMID"));
        assert!(table.contains("web01"));
        assert!(table.contains("running"));
        assert!(table.contains("2G"));
    }

    #[test]
    fn json_and_yaml_round_out_the_formats() {
        let json = render_vm(&vm(), OutputFormat::Json).unwrap();
        assert!(json.contains("\"status\": \"running\""));
        let yaml = render_vm(&vm(), OutputFormat::Yaml).unwrap();
        assert!(yaml.contains("name: web01"));
    }

    #[test]
    fn memory_formatting() {
        assert_eq!(format_bytes(512 * 1024 * 1024), "512M");
        assert_eq!(format_bytes(4 * 1024 * 1024 * 1024), "4G");
    }
}
