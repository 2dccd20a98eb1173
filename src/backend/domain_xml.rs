use std::path::Path;

use crate::backend::CreateRequest;
use crate::util;

/// Generate libvirt domain XML for a test VM: CoW disk on virtio, seed ISO
/// on sata, NAT through the default network with a fixed MAC so the DHCP
/// lease can be correlated later.
pub fn generate(req: &CreateRequest, disk: &Path, seed: &Path) -> String {
    let name = &req.name;
    let memory_kib = req.memory_mib * 1024;
    let cpus = req.cpus;
    let mac = &req.mac;
    let arch = util::host_arch();
    let machine = if arch == "aarch64" { "virt" } else { "q35" };
    let disk = disk.display();
    let seed = seed.display();

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='{arch}' machine='{machine}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='network'>
      <source network='default'/>
      <mac address='{mac}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_request() -> CreateRequest {
        CreateRequest {
            name: "mcpvm-swift-otter".into(),
            version: "9.5".into(),
            base_image: PathBuf::from("/images/rhel-9.5.qcow2"),
            seed_iso: PathBuf::from("/vms/mcpvm-swift-otter/seed.iso"),
            mac: "52:54:00:ab:01:cd".into(),
            cpus: 2,
            memory_mib: 2048,
        }
    }

    #[test]
    fn xml_contains_identity_and_resources() {
        let req = sample_request();
        let xml = generate(
            &req,
            &PathBuf::from("/vms/mcpvm-swift-otter/disk.qcow2"),
            &req.seed_iso,
        );
        assert!(xml.contains("<name>mcpvm-swift-otter</name>"));
        assert!(xml.contains("<memory unit='KiB'>2097152</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
    }

    #[test]
    fn xml_wires_disks_and_network() {
        let req = sample_request();
        let xml = generate(
            &req,
            &PathBuf::from("/vms/mcpvm-swift-otter/disk.qcow2"),
            &req.seed_iso,
        );
        assert!(xml.contains("source file='/vms/mcpvm-swift-otter/disk.qcow2'"));
        assert!(xml.contains("source file='/vms/mcpvm-swift-otter/seed.iso'"));
        assert!(xml.contains("<mac address='52:54:00:ab:01:cd'/>"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(xml.contains("bus='virtio'"));
        assert!(xml.contains("bus='sata'"));
    }
}
