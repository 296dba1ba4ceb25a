#![no_main]
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use vfsd::modules::session::dispatch;
use vfsd::{Client, FsInfo, MemFs, Request, Vfs};

fuzz_target!(|data: &[u8]| {
    // A sequence of requests, one JSON document per line
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let requests: Vec<Request> = text
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        // Blocking mounts of unknown filesystems would wait forever
        .filter(|req| !matches!(req, Request::Mount { blocking: true, .. }))
        .collect();
    if requests.is_empty() {
        return;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };
    runtime.block_on(async {
        let vfs = Arc::new(Vfs::default());
        let _ = vfs.register_fs(FsInfo::new("tmpfs"), Arc::new(MemFs::new()));
        let _ = vfs.register_fs(FsInfo::new("scratch"), Arc::new(MemFs::new()));
        let _ = vfs.mount("/", "tmpfs", 1, "", false).await;

        let client = Client::new(vfs.clone());
        for request in requests {
            let _ = dispatch(&client, request).await;
        }

        // Every descriptor a request sequence opened can be closed again
        for fd in 0..vfs.config().max_open_files {
            let _ = client.close(fd).await;
        }
        assert_eq!(client.open_count(), 0);
    });
});
