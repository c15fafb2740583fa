//! §8 scenario 3: an orphan VCPU walks every transition-table cell from
//! RESET through a scheduler tick to RUNNING and back down to HALTED.

use std::sync::Arc;

use hvcore::arch::mock::MockArch;
use hvcore::manager::{Manager, VcpuSeed, VcpuState};

#[test]
fn orphan_vcpu_walks_the_full_lifecycle() {
    let manager = Manager::new(1, Arc::new(MockArch::new()));

    let id = manager
        .create_orphan_vcpu(VcpuSeed {
            name: "init".into(),
            priority: 5,
            time_slice_ns: 10_000_000,
            start_pc: 0x1000,
            start_sp: 0,
            affinity_cpu: 0,
        })
        .unwrap();
    assert_eq!(manager.vcpu_state(id).unwrap(), VcpuState::Reset);

    manager.vcpu_state_change(id, VcpuState::Ready).unwrap();
    assert_eq!(manager.vcpu_state(id).unwrap(), VcpuState::Ready);

    manager.scheduler_tick(0, 0).unwrap();
    assert_eq!(manager.vcpu_state(id).unwrap(), VcpuState::Running);

    manager.vcpu_state_change(id, VcpuState::Paused).unwrap();
    assert_eq!(manager.vcpu_state(id).unwrap(), VcpuState::Paused);

    manager.vcpu_state_change(id, VcpuState::Ready).unwrap();
    assert_eq!(manager.vcpu_state(id).unwrap(), VcpuState::Ready);

    manager.vcpu_state_change(id, VcpuState::Halted).unwrap();
    assert_eq!(manager.vcpu_state(id).unwrap(), VcpuState::Halted);
}
