use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::process::ClaudeProcess;
use crate::types::{Message, QueryOptions};
use crate::Result;

// ─── QueryStream ──────────────────────────────────────────────────────────

/// An async stream of [`Message`]s from a Claude Code subprocess.
///
/// Backed by a Tokio mpsc channel. A background task owns [`ClaudeProcess`]
/// and forwards messages until it receives a terminal `Result` message or
/// the process exits. Dropping `QueryStream` closes the receiver, which
/// causes the background task to exit on its next send attempt.
pub struct QueryStream {
    rx: mpsc::Receiver<Result<Message>>,
}

impl QueryStream {
    pub(crate) fn new(prompt: String, opts: QueryOptions) -> Self {
        Self::new_cancellable(prompt, opts, None)
    }

    /// Like `new`, but additionally races message reads against `cancel` —
    /// when it fires, the child is force-killed immediately rather than
    /// waiting for its next stdout line. The Process Supervisor uses this
    /// form so `cancel()` actually terminates a stuck child instead of only
    /// closing the channel the next time a line happens to arrive.
    pub(crate) fn new_cancellable(
        prompt: String,
        opts: QueryOptions,
        cancel: Option<tokio::sync::watch::Receiver<bool>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut process = match ClaudeProcess::spawn(&prompt, &opts).await {
                Ok(p) => p,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let mut cancel = cancel;
            let mut got_result = false;
            let mut was_cancelled = false;
            loop {
                let next = match &mut cancel {
                    Some(cancel_rx) => {
                        tokio::select! {
                            biased;
                            changed = cancel_rx.changed(), if !*cancel_rx.borrow() => {
                                if changed.is_ok() && *cancel_rx.borrow() {
                                    was_cancelled = true;
                                    break;
                                }
                                continue;
                            }
                            msg = process.next_message() => msg,
                        }
                    }
                    None => process.next_message().await,
                };

                match next {
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    Ok(None) => break, // EOF — process exited
                    Ok(Some(msg)) => {
                        let is_terminal = matches!(msg, Message::Result(_));
                        if is_terminal {
                            got_result = true;
                        }
                        if tx.send(Ok(msg)).await.is_err() {
                            break; // receiver dropped
                        }
                        if is_terminal {
                            break;
                        }
                    }
                }
            }

            // Process exited without ever emitting a terminal Result message —
            // surface a non-zero exit code and stderr if there is one.
            if !was_cancelled && !got_result {
                if let Some(exit_err) = process.wait_exit_error().await {
                    let _ = tx.send(Err(exit_err)).await;
                }
            }

            process.kill().await;
        });

        QueryStream { rx }
    }

    /// Test-only constructor: wrap a raw mpsc receiver as a `QueryStream`.
    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<Result<Message>>) -> Self {
        Self { rx }
    }
}

impl Stream for QueryStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
