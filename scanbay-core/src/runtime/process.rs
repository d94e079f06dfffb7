use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::debug;

/// Kill `root` and every process descended from it.
///
/// Descendants reachable through parent links are signalled deepest first.
/// On unix the process group led by `root` is then killed as a whole, which
/// reaches children already reparented away from an exited launcher; tasks
/// are spawned as group leaders for this. Returns how many processes the
/// tree walk signalled; a `root` that no longer exists yields `Ok(0)`.
pub async fn kill_process_tree(root: u32) -> Result<usize, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        let signalled = kill_tree_blocking(root);
        kill_process_group(root);
        signalled
    })
    .await
}

fn kill_tree_blocking(root: u32) -> usize {
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing(),
    );

    let root = Pid::from_u32(root);
    if system.process(root).is_none() {
        debug!(pid = root.as_u32(), "process already gone");
        return 0;
    }

    let mut tree = vec![root];
    let mut next = 0;
    while next < tree.len() {
        let parent = tree[next];
        let children: Vec<Pid> = system
            .processes()
            .iter()
            .filter(|(pid, process)| process.parent() == Some(parent) && !tree.contains(pid))
            .map(|(pid, _)| *pid)
            .collect();
        tree.extend(children);
        next += 1;
    }

    let mut signalled = 0;
    for pid in tree.iter().rev() {
        let killed = system.process(*pid).is_some_and(|process| process.kill());
        if killed {
            debug!(pid = pid.as_u32(), "killed");
            signalled += 1;
        }
    }
    signalled
}

/// `SIGKILL` every member of process group `pgid`. An empty group is not an
/// error.
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // 0 and 1 would address our own group and init's.
    let Some(pgid) = libc::pid_t::try_from(pgid).ok().filter(|pgid| *pgid > 1) else {
        return;
    };
    // SAFETY: killpg only takes integer arguments.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        debug!(pgid, "process group killed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}
