//! Reads one or more pcap files, reconstructs TCP (and, where key material
//! is supplied, TLS) streams, and prints one JSON line per reconstructed
//! pair.
//!
//! Grounded in `extract-sequence/src/main.rs`'s CLI shape, translated from
//! `structopt` to `clap` (see DESIGN.md).

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use reassembly_cli::pcap_source;
use reassembly_core::{
    CipherInitError, CipherSuiteInit, Event, FlowDemux, Handlers, RecordDecrypter, SecretStore, TlsReassembler,
};

/// Reconstruct TCP/TLS streams from a pcap capture.
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
struct CliArgs {
    /// Pcap files to process.
    #[arg(required = true)]
    pcap_files: Vec<PathBuf>,

    /// Only reconstruct the flow matching this address:port (either side).
    #[arg(short, long)]
    filter: Option<SocketAddr>,

    /// NSS "SSLKEYLOGFILE"-format file providing TLS master secrets.
    #[arg(long)]
    sslkeylog: Option<PathBuf>,
}

/// A [`CipherSuiteInit`] that never succeeds: actual TLS decryption requires
/// a real record-layer/crypto library, which is out of scope here (spec.md
/// §1 "cryptographic primitives ... remain external collaborators"). Wiring
/// a `--sslkeylog` file through this demo still exercises the state machine
/// up through key lookup and reports, honestly, that it cannot go further.
struct UnimplementedCipherSuite;

impl CipherSuiteInit for UnimplementedCipherSuite {
    fn init(
        &self,
        tls_version: u16,
        cipher_suite: u16,
        _master_secret: &[u8; 48],
        _client_random: &[u8; 32],
        _server_random: &[u8; 32],
    ) -> Result<(Box<dyn RecordDecrypter>, Box<dyn RecordDecrypter>), CipherInitError> {
        tracing::info!(tls_version, cipher_suite, "key material found, but no record-layer library is wired in");
        Err(CipherInitError::UnsupportedCipherSuite(cipher_suite))
    }
}

struct JsonLineSink;

impl reassembly_core::EventSink for JsonLineSink {
    fn handle(&mut self, event: Event) {
        #[derive(serde::Serialize)]
        struct Line<'a> {
            flow: String,
            protocol: &'a str,
            ts: f64,
            sent_len: usize,
            recv_len: usize,
            ja3: Option<&'a str>,
            ja3s: Option<&'a str>,
        }

        let (flow_event, info) = match &event {
            Event::Tcp(ev) => (ev, None),
            Event::Tls(ev, info) => (ev, Some(info.as_ref())),
        };

        let line = Line {
            flow: flow_event.flow.to_string(),
            protocol: event.protocol_tag(),
            ts: flow_event.ts(),
            sent_len: flow_event.sent.len(),
            recv_len: flow_event.recv.len(),
            ja3: info.and_then(|i| i.ja3.as_deref()),
            ja3s: info.and_then(|i| i.ja3s.as_deref()),
        };
        match serde_json::to_string(&line) {
            Ok(json) => println!("{json}"),
            Err(err) => tracing::error!(%err, "failed to serialize event"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli_args = CliArgs::parse();

    let secrets = match &cli_args.sslkeylog {
        Some(path) => {
            let contents = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            SecretStore::from_sslkeylog(&contents)
        }
        None => SecretStore::new(),
    };

    for file in &cli_args.pcap_files {
        tracing::info!(file = %file.display(), "processing pcap");
        let content = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        let packets = pcap_source::read_packets(&content).with_context(|| format!("parsing {}", file.display()))?;

        let handlers = Handlers::builder()
            .port(443, {
                let secrets = secrets.clone();
                move |flow| {
                    Box::new(TlsReassembler::new(
                        flow,
                        Box::new(UnimplementedCipherSuite),
                        secrets.clone(),
                        Box::new(JsonLineSink),
                    ))
                }
            })
            .generic(|_flow| Box::new(JsonLineSink))
            .build();
        let mut demux = FlowDemux::new(handlers, Default::default());

        for packet in &packets {
            if let Some(filter) = cli_args.filter {
                let matches = (packet.src_ip, packet.src_port) == (filter.ip(), filter.port())
                    || (packet.dst_ip, packet.dst_port) == (filter.ip(), filter.port());
                if !matches {
                    continue;
                }
            }
            demux.process(packet.src_ip, packet.dst_ip, packet.as_segment(), packet.src_port, packet.dst_port);
        }

        for (flow, warnings) in demux.finish() {
            for warning in warnings {
                tracing::warn!(%flow, ts = warning.ts, seq_end = warning.seq_end, ack = warning.ack, "segment still pending at end of capture");
            }
        }

        let stats = demux.stats();
        tracing::info!(
            segments_seen = stats.segments_seen,
            segments_dropped_unroutable = stats.segments_dropped_unroutable,
            flows_created = stats.flows_created,
            "finished pcap"
        );
    }

    Ok(())
}
