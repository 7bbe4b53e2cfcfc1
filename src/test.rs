use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::chatbot::{END_OF_LINE, END_OF_TEXT};
use crate::core::config::ChatOptions;
use crate::core::error::{ChatError, Result};
use crate::core::model::{Engine, LoadEngine};
use crate::core::sampler::TokenSampler;
use crate::core::types::{ChatModel, ChatPhase, Chatbot, Sampler, StopReason, Tokenizer, Vocabulary};

// ids in the bundled dictionary
const NEWLINE: usize = 11;
const DOUBLE_NEWLINE: usize = 257;
const HELLO: usize = 303;
const WORLD: usize = 304;
const COMMA_CJK: usize = 354;
const E4_BD: usize = 392;

/// Engine stand-in: counts evaluated tokens in state[0] and always predicts flat logits.
struct MockEngine {
    logits_len: usize,
    evals: Mutex<Vec<(usize, f32)>>,  // (token, state[0] before the eval)
    fail_at: Option<usize>
}

impl MockEngine {
    fn new() -> Self {
        MockEngine { logits_len: 400, evals: Mutex::new(Vec::new()), fail_at: None }
    }

    fn failing_at(eval: usize) -> Self {
        MockEngine { fail_at: Some(eval), ..Self::new() }
    }

    fn eval_count(&self) -> usize {
        self.evals.lock().unwrap().len()
    }
}

impl Engine for MockEngine {
    fn state_len(&self) -> usize {
        2
    }

    fn logits_len(&self) -> usize {
        self.logits_len
    }

    fn init_state(&self, state: &mut [f32]) {
        state[0] = 0.0;
        state[1] = 7.0;
    }

    fn eval(&self, token: usize, state: &mut [f32], logits: &mut [f32]) -> Result<()> {
        let mut evals = self.evals.lock().unwrap();
        let n = evals.len();
        evals.push((token, state[0]));
        if self.fail_at == Some(n) {
            return Err(ChatError::Engine(format!("fault on eval {}", n)));
        }
        state[0] += 1.0;
        logits.fill(0.0);
        Ok(())
    }
}

impl LoadEngine for MockEngine {
    fn load(model_path: &Path, _threads: u32) -> Result<Self> {
        if model_path.extension().is_some_and(|ext| ext == "bad") {
            return Err(ChatError::ModelLoad("unsupported model format".to_string()));
        }
        Ok(Self::new())
    }
}

/// Replays a fixed token script and remembers the logits it was shown.
struct ScriptedSampler {
    script: Vec<usize>,
    calls: usize,
    seen: Vec<Vec<f32>>
}

impl ScriptedSampler {
    fn new(script: &[usize]) -> Self {
        ScriptedSampler { script: script.to_vec(), calls: 0, seen: Vec::new() }
    }
}

impl TokenSampler for ScriptedSampler {
    fn sample(&mut self, logits: &mut [f32]) -> Result<usize> {
        self.seen.push(logits.to_vec());
        let token = self.script[self.calls % self.script.len()];
        self.calls += 1;
        Ok(token)
    }
}

fn model(engine: MockEngine) -> ChatModel<MockEngine> {
    ChatModel::new(engine, Tokenizer::bundled().unwrap(), 2)
}

fn options(max_tokens: usize, stops: &[&str]) -> ChatOptions {
    ChatOptions {
        max_tokens,
        stop_sequences: stops.iter().map(|s| s.to_string()).collect(),
        ..ChatOptions::default()
    }
}

#[test]
fn test_bundled_vocabulary() {
    let tokenizer = Tokenizer::bundled().unwrap();
    assert_eq!(tokenizer.vocab_size(), 392);
    assert_eq!(tokenizer.encode("\n"), vec![NEWLINE]);
    assert_eq!(tokenizer.encode("\n\n"), vec![DOUBLE_NEWLINE]);
    assert_eq!(tokenizer.encode("Hello world"), vec![HELLO, WORLD]);
    assert_eq!(tokenizer.encode("，：？！"), vec![354, 355, 356, 357]);
    // longest match prefers the full character over the raw two-byte token
    let ni = tokenizer.encode("你");
    assert_eq!(ni.len(), 1);
    assert_ne!(ni[0], E4_BD);
    assert_eq!(tokenizer.decode(&[E4_BD]), vec![0xe4, 0xbd]);
}

#[test]
fn test_two_token_vocabulary() {
    let mut entries = vec![(1, b"A".to_vec()), (2, b"B".to_vec())];
    entries.extend(
        (0..=255u8)
            .filter(|b| *b != b'A' && *b != b'B')
            .map(|b| (1000 + b as usize, vec![b])),
    );
    let tokenizer = Tokenizer::new(Arc::new(Vocabulary::from_entries(entries).unwrap()));
    assert_eq!(tokenizer.encode("AB"), vec![1, 2]);
    assert_eq!(tokenizer.decode(&[1, 2]), b"AB");
}

#[test]
fn test_corrupt_dictionary_line() {
    let err = Vocabulary::parse("1 'a' 1\n2 'bc' 3\n").unwrap_err();
    match err {
        ChatError::DictionaryCorruption { line, .. } => assert_eq!(line, 2),
        other => panic!("unexpected error {other:?}"),
    }
}

proptest! {
    #[test]
    fn test_round_trip_bytes(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let tokenizer = Tokenizer::bundled().unwrap();
        let tokens = tokenizer.encode_bytes(&bytes);
        prop_assert!(tokens.len() <= bytes.len());
        prop_assert_eq!(tokenizer.decode(&tokens), bytes);
    }

    #[test]
    fn test_round_trip_text(text in "\\PC{0,64}") {
        let tokenizer = Tokenizer::bundled().unwrap();
        prop_assert_eq!(tokenizer.decode_text(&tokenizer.encode(&text)), text);
    }
}

#[test]
fn test_model_file_must_exist() {
    let tokenizer = Tokenizer::bundled().unwrap();
    let err = ChatModel::<MockEngine>::from_file("/no/such/model.bin", tokenizer.clone(), 2)
        .err()
        .unwrap();
    assert!(matches!(err, ChatError::ResourceNotFound(_)));

    let file = tempfile::NamedTempFile::new().expect("temp");
    let model = ChatModel::<MockEngine>::from_file(file.path(), tokenizer.clone(), 4).unwrap();
    assert_eq!(model.threads(), 4);

    let bad = tempfile::Builder::new().suffix(".bad").tempfile().expect("temp");
    assert!(matches!(
        ChatModel::<MockEngine>::from_file(bad.path(), tokenizer, 4),
        Err(ChatError::ModelLoad(_))
    ));
}

#[test]
fn test_max_token_cutoff() {
    let model = model(MockEngine::new());
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&[HELLO]), options(3, &["\n\n"]), "").unwrap();
    assert_eq!(bot.phase(), ChatPhase::PromptLoaded);

    let input_len = model.encode(&bot.format_turn("hi")).len();
    let output = bot.process("hi").unwrap();
    assert_eq!(output.stop, StopReason::MaxTokens);
    assert_eq!(output.tokens, vec![HELLO; 3]);
    assert_eq!(output.text, "HelloHelloHello");
    assert_eq!(bot.sampler().calls, 3);
    assert_eq!(model.engine().eval_count(), input_len + 3);
    assert_eq!(bot.phase(), ChatPhase::Idle);
}

#[test]
fn test_stop_sequence_across_pieces() {
    let model = model(MockEngine::new());
    let script = [HELLO, WORLD, NEWLINE, NEWLINE, HELLO];
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&script), options(20, &["\n\n"]), "").unwrap();

    let output = bot.process("hi").unwrap();
    assert_eq!(output.stop, StopReason::StopSequence("\n\n".to_string()));
    assert_eq!(output.text, "Hello world");
    assert_eq!(output.tokens.len(), 4);
    assert_eq!(bot.conversation().pieces(), &["Hello", " world", "\n", "\n"]);
}

#[test]
fn test_stop_sequences_checked_in_order() {
    let model = model(MockEngine::new());
    let script = [HELLO, WORLD, NEWLINE, NEWLINE];
    let mut bot =
        Chatbot::new(&model, ScriptedSampler::new(&script), options(20, &[" world", "\n\n"]), "").unwrap();
    let output = bot.process("hi").unwrap();
    assert_eq!(output.stop, StopReason::StopSequence(" world".to_string()));
    assert_eq!(output.text, "Hello");
}

#[test]
fn test_penalty_grows_then_decays() {
    let model = model(MockEngine::new());
    let mut script = vec![HELLO; 5];
    script.extend([WORLD; 10]);
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&script), options(15, &["<never>"]), "").unwrap();
    bot.process("hi").unwrap();

    // the engine predicts flat logits, so what the sampler sees for HELLO is minus its penalty
    let penalties: Vec<f32> = bot.sampler().seen.iter().map(|logits| -logits[HELLO]).collect();
    assert_eq!(penalties[0], 0.0);
    assert!(penalties[..6].windows(2).all(|w| w[1] > w[0]), "{penalties:?}");
    assert!(penalties[5..].windows(2).all(|w| w[1] < w[0]), "{penalties:?}");

    let occurrences = bot.conversation().occurrences();
    assert!(occurrences.get(HELLO) < 5.0);
    assert!(occurrences.get(WORLD) > 9.0);
}

#[test]
fn test_forced_logits() {
    let model = model(MockEngine::new());
    let script = [COMMA_CJK, HELLO, HELLO];
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&script), options(3, &["\n\n"]), "").unwrap();
    bot.process("hi").unwrap();

    let seen = &bot.sampler().seen;
    // after the prompt and after the first token a line break is ruled out
    assert_eq!(seen[0][END_OF_LINE], f32::NEG_INFINITY);
    assert_eq!(seen[1][END_OF_LINE], f32::NEG_INFINITY);
    assert!(seen[2][END_OF_LINE] < -3.0 && seen[2][END_OF_LINE].is_finite());
    // end of text is never offered once generation runs
    assert!(seen[1..].iter().all(|logits| logits[END_OF_TEXT] == f32::NEG_INFINITY));
    // punctuation is not repeated right away
    assert_eq!(seen[1][COMMA_CJK], f32::NEG_INFINITY);
    assert!(seen[2][COMMA_CJK].is_finite());
}

#[test]
fn test_split_codepoint_is_withheld() {
    let model = model(MockEngine::new());
    let a0 = 0xa0 + 1;
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&[E4_BD, a0]), options(2, &["\n\n"]), "").unwrap();
    let output = bot.process("hi").unwrap();
    assert_eq!(output.text, "你");
    assert_eq!(bot.conversation().pieces(), &["你"]);
    assert!(!output.text.contains('\u{FFFD}'));
}

#[test]
fn test_turns_restart_from_baseline() {
    let model = model(MockEngine::new());
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&[HELLO]), options(4, &["\n\n"]), "User: hi\n\nBot: hello").unwrap();
    let prompt_len = model.engine().eval_count() as f32;
    assert_eq!(bot.conversation().baseline()[0], prompt_len);

    for message in ["first", "second"] {
        let before = model.engine().eval_count();
        bot.process(message).unwrap();
        let evals = model.engine().evals.lock().unwrap();
        assert_eq!(evals[before].1, prompt_len, "turn `{message}` must start from the prompt state");
        assert_eq!(bot.conversation().baseline(), &[prompt_len, 7.0]);
    }
}

#[test]
fn test_streaming_matches_output() {
    let model = model(MockEngine::new());
    let script = [HELLO, WORLD, NEWLINE, NEWLINE, HELLO];
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&script), options(20, &["\n\n"]), "").unwrap();

    let (fragments, output) = thread::scope(|s| {
        let (rx, producer) = bot.stream("hi", 1, s);
        let fragments: Vec<String> = rx.collect();
        (fragments, producer.join().unwrap())
    });
    let output = output.unwrap();
    assert_eq!(fragments, vec!["Hello", " world"]);
    assert_eq!(fragments.concat(), output.text);
}

#[test]
fn test_streaming_flushes_held_tail_at_max_tokens() {
    let model = model(MockEngine::new());
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&[HELLO, NEWLINE]), options(2, &["\n\n"]), "").unwrap();
    let output = thread::scope(|s| {
        let (rx, producer) = bot.stream("hi", 8, s);
        let streamed: String = rx.collect();
        let output = producer.join().unwrap().unwrap();
        assert_eq!(streamed, output.text);
        output
    });
    assert_eq!(output.text, "Hello\n");
}

#[test]
fn test_stream_cancellation() {
    let model = model(MockEngine::new());
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&[HELLO]), options(50, &["<never>"]), "").unwrap();

    let output = thread::scope(|s| {
        let (mut rx, producer) = bot.stream("hi", 1, s);
        assert_eq!(rx.next().as_deref(), Some("Hello"));
        drop(rx);
        producer.join().unwrap()
    });
    let output = output.unwrap();
    assert_eq!(output.stop, StopReason::Cancelled);
    assert!(output.tokens.len() < 50);
    assert_eq!(bot.phase(), ChatPhase::Idle);
}

#[test]
fn test_cancel_while_holding_receiver() {
    let model = model(MockEngine::new());
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&[HELLO]), options(200, &["<never>"]), "").unwrap();

    let output = thread::scope(|s| {
        let (mut rx, producer) = bot.stream("hi", 1, s);
        assert_eq!(rx.next().as_deref(), Some("Hello"));
        // let the producer fill the channel and block on the next send
        thread::sleep(Duration::from_millis(50));
        rx.cancel();
        let output = producer.join().unwrap();
        assert_eq!(rx.next(), None);
        output
    });
    let output = output.unwrap();
    assert_eq!(output.stop, StopReason::Cancelled);
    assert!(output.tokens.len() < 200);
}

#[test]
fn test_phase_after_construction_and_turns() {
    let model = model(MockEngine::failing_at(3));
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&[HELLO]), options(2, &["\n\n"]), "").unwrap();
    assert_eq!(bot.phase(), ChatPhase::PromptLoaded);
    assert!(bot.process("hi").is_err());
    assert_eq!(bot.phase(), ChatPhase::Idle);
    assert!(bot.process("hi").is_ok());
    assert_eq!(bot.phase(), ChatPhase::Idle);
}

#[test]
fn test_session_keeps_context_between_calls() {
    let model = model(MockEngine::new());
    let mut session = model.session(ScriptedSampler::new(&[HELLO]), options(2, &["\n\n"])).unwrap();
    let first_len = model.encode("Once upon").len();

    let output = session.predict("Once upon").unwrap();
    assert_eq!(output.text, "HelloHello");
    assert_eq!(session.evaluated(), first_len + 2);
    assert_eq!(session.state()[0], (first_len + 2) as f32);

    let before = model.engine().eval_count();
    session.predict(" a time").unwrap();
    // the second call starts from where the first one stopped, not from a fresh state
    assert_eq!(model.engine().evals.lock().unwrap()[before].1, (first_len + 2) as f32);
    assert_eq!(session.state()[0], session.evaluated() as f32);

    session.reset();
    assert_eq!(session.evaluated(), 0);
    assert_eq!(session.state(), &[0.0, 7.0]);
}

#[test]
fn test_session_stream() {
    let model = model(MockEngine::new());
    let script = [HELLO, WORLD, DOUBLE_NEWLINE];
    let mut session = model.session(ScriptedSampler::new(&script), options(10, &["\n\n"])).unwrap();

    let (fragments, output) = thread::scope(|s| {
        let (rx, producer) = session.stream("Once", 2, s);
        let fragments: Vec<String> = rx.collect();
        (fragments, producer.join().unwrap().unwrap())
    });
    assert_eq!(fragments.concat(), "Hello world");
    assert_eq!(output.text, "Hello world");
    assert_eq!(output.stop, StopReason::StopSequence("\n\n".to_string()));
    assert_eq!(session.sampler().calls, 3);
}

#[test]
fn test_engine_fault_aborts_turn() {
    let tokenizer = Tokenizer::bundled().unwrap();
    let input_len = tokenizer.encode("User: hi\n\nBot: ").len();
    // fail on the second generated token
    let model = model(MockEngine::failing_at(input_len + 1));
    let mut bot = Chatbot::new(&model, ScriptedSampler::new(&[HELLO, WORLD]), options(5, &["\n\n"]), "").unwrap();

    let (mut tx, rx) = std::sync::mpsc::sync_channel::<String>(16);
    let err = bot.process_stream("hi", &mut tx).unwrap_err();
    assert!(matches!(err, ChatError::Engine(_)));
    assert_eq!(bot.phase(), ChatPhase::Idle);
    drop(tx);
    assert_eq!(rx.iter().collect::<Vec<_>>(), vec!["Hello"]);

    // the fault is not sticky: the next turn starts over from the baseline
    let output = bot.process("hi").unwrap();
    assert_eq!(output.tokens.len(), 5);
}

#[test]
fn test_invalid_options_rejected_at_session_start() {
    let model = model(MockEngine::new());
    let bad = ChatOptions { top_p: 2.0, ..ChatOptions::default() };
    assert!(matches!(
        Chatbot::new(&model, ScriptedSampler::new(&[HELLO]), bad, ""),
        Err(ChatError::Parameter { .. })
    ));
}

#[test]
fn test_plain_completion() {
    let model = model(MockEngine::new());
    let mut sampler = ScriptedSampler::new(&[HELLO, WORLD, DOUBLE_NEWLINE, HELLO]);
    let output = model.complete("Once", &options(10, &["\n\n"]), &mut sampler).unwrap();
    assert_eq!(output.text, "Hello world");
    assert_eq!(output.stop, StopReason::StopSequence("\n\n".to_string()));
    assert_eq!(sampler.calls, 3);
}

#[test]
fn test_chat_with_seeded_sampler() {
    let model = model(MockEngine::new());
    let options = options(16, &["\n\n"]);
    let run = |seed| {
        let sampler = Sampler::from_options(&options, StdRng::seed_from_u64(seed));
        let mut bot = Chatbot::new(&model, sampler, options.clone(), "").unwrap();
        bot.process("hello there").unwrap()
    };
    let first = run(3);
    assert!(!first.tokens.is_empty() && first.tokens.len() <= 16);
    assert_eq!(first.tokens, run(3).tokens);
}
