#![no_main]
use std::convert::Infallible;

use bytes::Bytes;
use futures::{future, stream};
use libfuzzer_sys::fuzz_target;
use multipart_stress::{BodyEnd, Boundary, FormConfig, IncomingForm};
use tokio::{runtime, sync::mpsc};

fuzz_target!(|body: &[u8]| {
    let stream = stream::once(future::ready(Ok::<_, Infallible>(Bytes::copy_from_slice(body))));
    let boundary = Boundary::new("xoxo");

    let uploads = std::env::temp_dir().join("multipart-stress-fuzz");
    std::fs::create_dir_all(&uploads).expect("upload dir");

    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let (events, mut rx) = mpsc::unbounded_channel();
    let form = IncomingForm::new(FormConfig::new(&uploads).with_max_files(Some(4)), events);

    rt.block_on(async {
        let parsed = form
            .parse(stream, &boundary, future::ready(BodyEnd::Complete))
            .await;

        let mut terminal = 0;
        while let Ok(event) = rx.try_recv() {
            if event.is_terminal() {
                terminal += 1;
            }
        }
        assert_eq!(terminal, 1);

        for file in parsed.files.values().flatten() {
            let _ = std::fs::remove_file(&file.path);
        }
    });
});
