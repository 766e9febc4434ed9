use std::{sync::Arc, time::Duration};

use tracing::debug;

use odo_core::Cancellation;

use crate::{
    events::{DevEvent, Events},
    process::RemoteProcessController,
    CommandError,
};

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Streams a supervised command's log file to the console, line by line, until `cancel` fires
pub async fn follow_log(
    processes: Arc<RemoteProcessController>,
    pod: String,
    container: String,
    command_id: String,
    events: Events,
    cancel: Cancellation,
) {
    let mut offset = 0u64;
    let mut pending = String::new();
    loop {
        match processes.read_log(&pod, &container, &command_id, offset, &cancel).await {
            Ok(chunk) => {
                offset += chunk.len() as u64;
                pending.push_str(&String::from_utf8_lossy(&chunk));
                for line in take_lines(&mut pending) {
                    events.push(DevEvent::Output {
                        container: container.clone(),
                        line,
                    });
                }
            }
            Err(CommandError::Interrupted(_)) => return,
            Err(err) => {
                debug!(code = "log_read_failed", command = %command_id, error = %err);
            }
        }
        if cancel.run(tokio::time::sleep(LOG_POLL_INTERVAL)).await.is_err() {
            return;
        }
    }
}

// Complete lines are removed from `pending`; a trailing partial line stays for the next read.
fn take_lines(pending: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(newline) = pending.find('\n') {
        let line: String = pending.drain(..=newline).collect();
        lines.push(line.trim_end_matches(&['\r', '\n'][..]).to_owned());
    }
    lines
}

#[cfg(test)]
mod tests {
    use odo_core::PlatformKind;
    use odo_test_util::fake::FakePlatform;

    use super::*;
    use crate::process::ProcessSpec;

    #[test]
    fn partial_lines_wait_for_their_newline() {
        let mut pending = "listening on 3000\r\nGET / 200\nGET /fav".to_owned();
        assert_eq!(take_lines(&mut pending), vec!["listening on 3000", "GET / 200"]);
        assert_eq!(pending, "GET /fav");
    }

    #[tokio::test]
    async fn output_reaches_the_console() {
        odo_test_util::prep();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let processes = Arc::new(RemoteProcessController::new(
            platform.clone(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let cancel = Cancellation::new();
        let spec = ProcessSpec {
            command_id: "r".to_owned(),
            command_line: "node app.js".to_owned(),
            working_dir: "/projects".to_owned(),
            env: Vec::new(),
        };
        processes.start("web-app", "web", &spec, &cancel).await.unwrap();
        platform.append_output("web-app", "web", "r", "listening on 3000\n");

        let (events, mut rx) = Events::channel();
        let follower = tokio::spawn(follow_log(
            processes,
            "web-app".to_owned(),
            "web".to_owned(),
            "r".to_owned(),
            events,
            cancel.clone(),
        ));
        let event = futures::StreamExt::next(&mut rx).await.unwrap();
        assert_eq!(
            event,
            DevEvent::Output {
                container: "web".to_owned(),
                line: "listening on 3000".to_owned()
            }
        );
        cancel.cancel();
        follower.await.unwrap();
    }
}
