//! Pre-connection pipeline for one accepted socket.
//!
//! An [`ActiveSocket`] owns the socket from accept until it either moves
//! into a live connection, is handed off to an internal listener, or is
//! aborted. The pipeline runs as one dispatcher task: filter suspension is
//! expressed by awaiting the socket's resume queue, so
//! `continue_filter_chain` can be invoked from inside a filter, from a
//! spawned task or from a timer without recursing into the chain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::ListenerInfo;
use crate::filter::{
    FilterChainResumer, FilterStatus, FilterWrapper, ListenerFilterContext, ResumeMessage,
};
use crate::network::{ConnectionSocket, DynamicMetadata, StreamInfo};

use super::StreamListenerCore;

enum PipelineOutcome {
    /// Filters completed; promote to a connection.
    Connected,
    /// Filter refusal, error or timeout; close without a connection.
    Aborted,
    /// Socket moves to an internal listener; no connection here.
    HandedOff(String),
}

pub(crate) struct ActiveSocket {
    listener: Arc<StreamListenerCore>,
    /// Config snapshot taken at accept. Hot replacement does not affect
    /// sockets already in flight, including their timeout.
    info: Arc<ListenerInfo>,
    socket: ConnectionSocket,
    stream_info: StreamInfo,
    filters: Vec<FilterWrapper>,
    cursor: usize,
    resume_tx: mpsc::UnboundedSender<ResumeMessage>,
    resume_rx: mpsc::UnboundedReceiver<ResumeMessage>,
    handoff: Option<String>,
    hand_off_restored_destinations: bool,
    rebalanced: bool,
}

impl ActiveSocket {
    pub(crate) fn new(
        listener: Arc<StreamListenerCore>,
        info: Arc<ListenerInfo>,
        socket: ConnectionSocket,
        hand_off_restored_destinations: bool,
        rebalanced: bool,
        metadata: Option<DynamicMetadata>,
    ) -> Self {
        listener.stats.downstream_pre_cx_active.inc();

        let mut stream_info = StreamInfo::new(&socket);
        if let Some(metadata) = metadata {
            stream_info.merge_metadata(metadata);
        }

        let filters = info
            .listener_filters()
            .iter()
            .map(|entry| FilterWrapper {
                matcher: entry.matcher.clone(),
                filter: entry.factory.create(),
            })
            .collect();

        let (resume_tx, resume_rx) = mpsc::unbounded_channel();

        Self {
            listener,
            info,
            socket,
            stream_info,
            filters,
            cursor: 0,
            resume_tx,
            resume_rx,
            handoff: None,
            hand_off_restored_destinations,
            rebalanced,
        }
    }

    pub(crate) async fn run(mut self) {
        trace!(
            listener = %self.listener.name(),
            remote = %self.socket.remote_addr(),
            rebalanced = self.rebalanced,
            hand_off = self.hand_off_restored_destinations,
            "starting listener filter chain"
        );

        let timeout = self.info.listener_filters_timeout();
        let outcome = if timeout.is_zero() {
            self.iterate_filters().await
        } else {
            self.iterate_with_timeout(timeout).await
        };
        self.finish(outcome);
    }

    async fn iterate_with_timeout(&mut self, timeout: Duration) -> PipelineOutcome {
        match tokio::time::timeout(timeout, self.iterate_filters()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.listener.stats.downstream_pre_cx_timeout.inc();
                if self.info.continue_on_listener_filters_timeout() {
                    debug!(
                        listener = %self.listener.name(),
                        cursor = self.cursor,
                        "listener filters timed out, skipping the stuck filter"
                    );
                    // Outstanding resumers for the skipped filter are stale
                    // from here on and will be ignored by index.
                    self.cursor += 1;
                    self.iterate_filters().await
                } else {
                    debug!(
                        listener = %self.listener.name(),
                        cursor = self.cursor,
                        "listener filters timed out, closing socket"
                    );
                    PipelineOutcome::Aborted
                }
            }
        }
    }

    async fn iterate_filters(&mut self) -> PipelineOutcome {
        loop {
            if let Some(target) = self.handoff.take() {
                return PipelineOutcome::HandedOff(target);
            }
            if self.cursor >= self.filters.len() {
                return PipelineOutcome::Connected;
            }

            let index = self.cursor;
            if !self.filters[index].matcher.applies(&self.socket) {
                self.cursor += 1;
                continue;
            }

            let status = {
                let mut cx = ListenerFilterContext {
                    socket: &mut self.socket,
                    stream_info: &mut self.stream_info,
                    resumer: FilterChainResumer {
                        tx: self.resume_tx.clone(),
                        index,
                    },
                    dispatcher: self.listener.dispatcher(),
                    handoff: &mut self.handoff,
                };
                self.filters[index].filter.on_accept(&mut cx).await
            };

            match status {
                Err(e) => {
                    debug!(
                        listener = %self.listener.name(),
                        index,
                        error = %e,
                        "listener filter failed, closing socket"
                    );
                    return PipelineOutcome::Aborted;
                }
                Ok(FilterStatus::Continue) => {
                    self.cursor += 1;
                }
                Ok(FilterStatus::StopIteration) => {
                    // Suspended on this filter; the cursor stays put until a
                    // resume for exactly this position arrives.
                    if !self.wait_for_resume(index).await {
                        return PipelineOutcome::Aborted;
                    }
                    self.cursor += 1;
                }
            }
        }
    }

    /// Wait for `continue_filter_chain` aimed at the suspended filter.
    /// Resumes carrying a stale cursor index are no-ops.
    async fn wait_for_resume(&mut self, index: usize) -> bool {
        loop {
            match self.resume_rx.recv().await {
                Some(message) if message.index == index => return message.success,
                Some(stale) => {
                    trace!(
                        listener = %self.listener.name(),
                        stale = stale.index,
                        current = index,
                        "ignoring stale filter chain resume"
                    );
                }
                // Unreachable while the socket holds its own sender; treat a
                // closed queue as a refusal anyway.
                None => return false,
            }
        }
    }

    fn finish(mut self, outcome: PipelineOutcome) {
        match outcome {
            PipelineOutcome::Connected => {
                self.stream_info.refresh_addresses(&self.socket);
                self.listener
                    .new_connection(self.socket, self.stream_info, &self.info);
            }
            PipelineOutcome::Aborted => {
                // Socket never became a connection; release the per-listener
                // commitment. Dropping the socket closes it and returns the
                // global slot.
                self.listener.dec_num_connections();
            }
            PipelineOutcome::HandedOff(target) => {
                let metadata = self.stream_info.take_metadata();
                match self.listener.dispatcher().internal_listener(&target) {
                    Some(handle) => {
                        debug!(
                            listener = %self.listener.name(),
                            target = %target,
                            "handing socket off to internal listener"
                        );
                        handle.push(self.socket, metadata);
                    }
                    None => {
                        debug!(
                            listener = %self.listener.name(),
                            target = %target,
                            "internal listener not found, dropping socket"
                        );
                    }
                }
                self.listener.dec_num_connections();
            }
        }
        self.listener.stats.downstream_pre_cx_active.dec();
    }
}
