fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use flatpass_core::{
        frame_channel,
        hmm::{HmmDefinition, TransitionMatrix},
        model::stub::{ContextIndependent, TableDictionary, TableLanguageModel},
        model::{Dictionary, PhoneId},
        ArcBuffer, LogMath, Score, SearchConfig, SearchEngine, SearchModels, WaitStatus, WordArc,
    };
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde::Serialize;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tracing_subscriber::EnvFilter;

    const N_PHONES: usize = 12;
    const N_EMIT: usize = 3;
    const SILENCE: PhoneId = 0;
    const DISTRACTORS_PER_WORD: usize = 4;

    #[derive(Debug)]
    struct Args {
        config: Option<PathBuf>,
        words: usize,
        frames: usize,
        utterances: usize,
        seed: u64,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct UtteranceResult {
        utterance: u64,
        latency_ms: f64,
        frames: usize,
        entries: usize,
        reference: Vec<String>,
        hypothesis: Vec<String>,
        word_match_rate: f64,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Summary {
        vocabulary: usize,
        utterances: usize,
        total_frames: usize,
        wall_ms: f64,
        frames_per_second: f64,
        p50_latency_ms: f64,
        p95_latency_ms: f64,
        avg_word_match_rate: f64,
        arcs_received: usize,
        diagnostics: flatpass_core::engine::pipeline::DiagnosticsSnapshot,
        results: Vec<UtteranceResult>,
    }

    struct ScriptedUtterance {
        reference: Vec<String>,
        frames: Vec<Vec<Score>>,
        arcs: Vec<WordArc>,
    }

    fn parse_args() -> Result<Args, String> {
        let mut args = Args {
            config: None,
            words: 200,
            frames: 300,
            utterances: 5,
            seed: 42,
            output: None,
        };

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            let mut value = |name: &str| it.next().ok_or_else(|| format!("missing value for {name}"));
            match arg.as_str() {
                "--config" => args.config = Some(PathBuf::from(value("--config")?)),
                "--output" => args.output = Some(PathBuf::from(value("--output")?)),
                "--words" => {
                    args.words = value("--words")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --words".to_string())?
                        .max(2);
                }
                "--frames" => {
                    args.frames = value("--frames")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --frames".to_string())?
                        .max(20);
                }
                "--utterances" => {
                    args.utterances = value("--utterances")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --utterances".to_string())?
                        .max(1);
                }
                "--seed" => {
                    args.seed = value("--seed")?
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --seed".to_string())?;
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p flatpass-core --bin benchmark -- \\
  [--config <file.json>] [--words <n>] [--frames <n>] [--utterances <n>] \\
  [--seed <n>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(args)
    }

    /// Random pronunciations over `N_PHONES` context-independent phones, each
    /// with `N_EMIT` senones, and a bigram LM with back-off.
    fn build_models(
        rng: &mut StdRng,
        n_words: usize,
    ) -> Result<(SearchModels, Vec<Vec<PhoneId>>, Vec<usize>), String> {
        let mut dict = TableDictionary::new(SILENCE);
        let mut prons = Vec::with_capacity(n_words);
        let mut ids = Vec::with_capacity(n_words);
        for i in 0..n_words {
            let n = rng.gen_range(1..=4);
            let phones: Vec<PhoneId> = (0..n).map(|_| rng.gen_range(1..N_PHONES)).collect();
            let id = dict
                .add_word(&format!("w{i}"), &phones)
                .map_err(|e| e.to_string())?;
            prons.push(phones);
            ids.push(id);
        }
        dict.add_filler("++noise++", &[SILENCE])
            .map_err(|e| e.to_string())?;

        let mut lm = TableLanguageModel::new()
            .with_backoff(-2_000)
            .unigram(dict.finish_word(), -3_000);
        for &w in &ids {
            lm = lm.unigram(w, rng.gen_range(-40_000..-20_000));
            for _ in 0..3 {
                let next = ids[rng.gen_range(0..ids.len())];
                lm = lm.bigram(w, next, rng.gen_range(-15_000..-5_000));
            }
        }

        let lmath = LogMath::default();
        let tmat = TransitionMatrix::left_to_right(&lmath, N_EMIT, 0.6).map_err(|e| e.to_string())?;
        let sseqs = (0..N_PHONES)
            .map(|p| (0..N_EMIT).map(|s| p * N_EMIT + s).collect())
            .collect();
        let hmm = HmmDefinition::new(N_PHONES * N_EMIT, vec![tmat], sseqs)
            .map_err(|e| e.to_string())?;

        let models = SearchModels {
            dictionary: Arc::new(dict),
            context: Arc::new(ContextIndependent::new(N_PHONES, SILENCE)),
            hmm: Arc::new(hmm),
            lm: Arc::new(lm),
        };
        Ok((models, prons, ids))
    }

    /// Append frames in which `phone`'s senones win, state by state.
    fn speak(rng: &mut StdRng, frames: &mut Vec<Vec<Score>>, phone: PhoneId) {
        for state in 0..N_EMIT {
            for _ in 0..rng.gen_range(1..=3) {
                let hot = phone * N_EMIT + state;
                frames.push(
                    (0..N_PHONES * N_EMIT)
                        .map(|s| {
                            if s == hot {
                                rng.gen_range(-300..0)
                            } else {
                                rng.gen_range(-9_000..-3_000)
                            }
                        })
                        .collect(),
                );
            }
        }
    }

    fn script_utterance(
        rng: &mut StdRng,
        dict: &dyn Dictionary,
        prons: &[Vec<PhoneId>],
        ids: &[usize],
        target_frames: usize,
    ) -> ScriptedUtterance {
        let mut frames = Vec::new();
        let mut arcs = Vec::new();
        let mut reference = Vec::new();
        speak(rng, &mut frames, SILENCE);
        while frames.len() < target_frames {
            let k = rng.gen_range(0..ids.len());
            let sf = frames.len();
            for &p in &prons[k] {
                speak(rng, &mut frames, p);
            }
            let ef = frames.len() - 1;
            arcs.push(WordArc::hint(ids[k], sf, ef));
            for _ in 0..DISTRACTORS_PER_WORD {
                let d = ids[rng.gen_range(0..ids.len())];
                let jitter = rng.gen_range(0..=4);
                arcs.push(WordArc::hint(d, sf.saturating_sub(2) + jitter, ef));
            }
            reference.push(dict.word_str(ids[k]).to_string());
        }
        speak(rng, &mut frames, SILENCE);
        arcs.sort_by_key(|a| a.start_frame);
        ScriptedUtterance {
            reference,
            frames,
            arcs,
        }
    }

    fn word_match_rate(reference: &[String], hypothesis: &[String]) -> f64 {
        let span = reference.len().max(hypothesis.len());
        if span == 0 {
            return 1.0;
        }
        let matched = reference
            .iter()
            .zip(hypothesis)
            .filter(|(r, h)| r == h)
            .count();
        matched as f64 / span as f64
    }

    fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => SearchConfig::load(path).map_err(|e| e.to_string())?,
        None => SearchConfig::default(),
    };

    let mut rng = StdRng::seed_from_u64(args.seed);
    let (models, prons, ids) = build_models(&mut rng, args.words)?;
    let scripts: Vec<ScriptedUtterance> = (0..args.utterances)
        .map(|_| script_utterance(&mut rng, &*models.dictionary, &prons, &ids, args.frames))
        .collect();
    let total_frames: usize = scripts.iter().map(|s| s.frames.len()).sum();

    println!(
        "Running flatpass benchmark: {} utterances, {} frames, vocabulary {} (seed={})",
        args.utterances, total_frames, args.words, args.seed
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;

    let summary = runtime.block_on(async {
        let engine = SearchEngine::new(config, models).map_err(|e| e.to_string())?;
        let mut events = engine.subscribe_utterances();
        let (producer, consumer) = frame_channel(64);
        let input = Arc::new(ArcBuffer::new("first-pass"));
        let output = Arc::new(ArcBuffer::new("lattice"));

        let started = Instant::now();
        engine
            .start(consumer, Arc::clone(&input), Arc::clone(&output))
            .map_err(|e| e.to_string())?;

        let arc_scripts: Vec<Vec<WordArc>> = scripts.iter().map(|s| s.arcs.clone()).collect();
        let arc_lengths: Vec<usize> = scripts.iter().map(|s| s.frames.len()).collect();
        let arc_input = Arc::clone(&input);
        let arc_producer = std::thread::spawn(move || {
            for (arcs, n_frames) in arc_scripts.into_iter().zip(arc_lengths) {
                arc_input.start_utterance();
                let mut pending = arcs.into_iter().peekable();
                for f in 0..n_frames {
                    let ready: Vec<WordArc> =
                        std::iter::from_fn(|| pending.next_if(|a| a.start_frame <= f)).collect();
                    arc_input.push(ready, f + 1);
                }
                arc_input.end_utterance(true);
                if arc_input.is_shutdown() {
                    break;
                }
            }
        });

        let frame_scripts: Vec<Vec<Vec<Score>>> =
            scripts.iter().map(|s| s.frames.clone()).collect();
        let acoustic_producer = std::thread::spawn(move || {
            for frames in frame_scripts {
                producer.start_utterance()?;
                for frame in frames {
                    producer.push_frame(frame)?;
                }
                producer.end_utterance()?;
            }
            Ok::<_, flatpass_core::SearchError>(())
        });

        let sink = Arc::clone(&output);
        let output_consumer = std::thread::spawn(move || {
            let mut received = 0usize;
            loop {
                match sink.wait_for_start(Some(Duration::from_millis(200))) {
                    WaitStatus::Ready => {}
                    WaitStatus::TimedOut => continue,
                    _ => break,
                }
                let status = sink.wait_for_arcs(usize::MAX, None);
                received += sink.lock().len();
                sink.consumer_end_utterance();
                if status == WaitStatus::Cancelled {
                    break;
                }
            }
            received
        });

        let mut results = Vec::new();
        let mut last = started;
        for script in &scripts {
            let event = match tokio::time::timeout(Duration::from_secs(60), events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => return Err(format!("event stream failed: {e}")),
                Err(_) => return Err("timed out waiting for an utterance".into()),
            };
            let now = Instant::now();
            let latency_ms = now.duration_since(last).as_secs_f64() * 1000.0;
            last = now;
            println!(
                "utterance {} [{} frames] {:.1} ms: {}",
                event.utterance,
                event.frames,
                latency_ms,
                event.words.join(" ")
            );
            results.push(UtteranceResult {
                utterance: event.utterance,
                latency_ms,
                frames: event.frames,
                entries: event.entries,
                word_match_rate: word_match_rate(&script.reference, &event.words),
                reference: script.reference.clone(),
                hypothesis: event.words,
            });
        }
        let wall_ms = started.elapsed().as_secs_f64() * 1000.0;

        let diagnostics = engine.diagnostics_snapshot();
        engine.stop().map_err(|e| e.to_string())?;
        output.shutdown();
        let _ = arc_producer.join();
        let _ = acoustic_producer.join();
        let arcs_received = output_consumer
            .join()
            .map_err(|_| "output consumer panicked".to_string())?;

        let latencies: Vec<f64> = results.iter().map(|r| r.latency_ms).collect();
        let avg_word_match_rate =
            results.iter().map(|r| r.word_match_rate).sum::<f64>() / results.len().max(1) as f64;
        Ok::<_, String>(Summary {
            vocabulary: args.words,
            utterances: results.len(),
            total_frames,
            wall_ms,
            frames_per_second: total_frames as f64 / (wall_ms / 1000.0).max(1e-9),
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
            avg_word_match_rate,
            arcs_received,
            diagnostics,
            results,
        })
    })?;

    println!(
        "{:.0} frames/s, p50 {:.1} ms, p95 {:.1} ms, word match {:.1}%",
        summary.frames_per_second,
        summary.p50_latency_ms,
        summary.p95_latency_ms,
        summary.avg_word_match_rate * 100.0
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json).map_err(|e| e.to_string())?;
            println!("Wrote benchmark summary to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
