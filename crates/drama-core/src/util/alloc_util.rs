use log::debug;
use std::process::Command;

/// Compacts system memory.
///
/// Writes to `/proc/sys/vm/compact_memory` to defragment memory before a
/// large-page allocation.
///
/// # Errors
///
/// Returns error if system commands fail
pub fn compact_mem() -> Result<(), std::io::Error> {
    let output = Command::new("sh")
        .arg("-c")
        .arg("echo 1 | tee /proc/sys/vm/compact_memory")
        .output()?;
    if !output.status.success() {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pins the calling thread to a single CPU core.
///
/// Measurement threads are pinned so that all rounds of one pair run on the
/// same core with comparable cache, TLB and timer state.
///
/// # Errors
///
/// Returns the OS error if `sched_setaffinity` fails (e.g., the core does not exist).
pub fn pin_to_core(core: usize) -> Result<(), std::io::Error> {
    let set = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        set
    };
    let r = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if r != 0 {
        return Err(std::io::Error::last_os_error());
    }
    debug!("pinned thread to core {}", core);
    Ok(())
}

/// Returns the number of cores the process may run on.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
