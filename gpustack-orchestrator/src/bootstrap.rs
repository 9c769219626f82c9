use gpustack_providers::ssh::sh_escape_single;

use crate::config::WorkloadSettings;

/// Host bootstrap pushed during `configuring`: the env file the workload reads,
/// network storage mounts and the working directory.
/// Emits `::phase::<name>` markers so remote output can be traced.
pub fn render_bootstrap(stack_name: &str, workload: &WorkloadSettings, storage_id: Option<&str>) -> String {
    let mut s = String::from("#!/bin/bash\nset -euo pipefail\n");
    s.push_str("echo \"::phase::env\"\n");
    s.push_str("install -d -m 0755 /etc/gpustack\n");
    s.push_str(": > /etc/gpustack/stack.env\n");

    let mut env: Vec<(String, String)> = vec![("GPUSTACK_STACK".to_string(), stack_name.to_string())];
    if let Some(id) = storage_id {
        env.push(("GPUSTACK_STORAGE_ID".to_string(), id.to_string()));
    }
    env.extend(workload.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (k, v) in &env {
        s.push_str(&format!(
            "printf '%s=%s\\n' {} {} >> /etc/gpustack/stack.env\n",
            sh_escape_single(k),
            sh_escape_single(v)
        ));
    }

    if !workload.mounts.is_empty() {
        s.push_str("echo \"::phase::mounts\"\n");
        for (mount_point, source) in &workload.mounts {
            let mp = sh_escape_single(mount_point);
            s.push_str(&format!("mkdir -p {}\n", mp));
            s.push_str(&format!(
                "mountpoint -q {mp} || mount -t nfs4 -o nfsvers=4.1,hard,timeo=600,retrans=2 {src} {mp}\n",
                mp = mp,
                src = sh_escape_single(source)
            ));
        }
    }

    s.push_str("echo \"::phase::workdir\"\n");
    let dir = sh_escape_single(&workload.remote_dir);
    s.push_str(&format!("mkdir -p {}\n", dir));
    s.push_str(&format!("cp /etc/gpustack/stack.env {}/.env\n", dir));
    s.push_str("echo \"::phase::done\"\n");
    s
}
