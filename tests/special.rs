use std::fs::{self, File};
use std::os::unix::prelude::AsRawFd;

use tempfile::tempdir;

use runbox::{special_judge, FlowOutcome, RunBoxBuilder, SPECIAL_CRASH_MESSAGE};

mod common;

fn checker(script: &str) -> RunBoxBuilder {
  RunBoxBuilder::new("/bin/sh", vec!["-c", script]).label("checker")
}

#[test]
fn exit_zero_accepts() {
  common::setup();

  let option = checker("echo ok; exit 0").build().unwrap();
  assert_eq!(special_judge(&option).unwrap(), FlowOutcome::Success);
}

#[test]
fn exit_one_explains_the_mismatch() {
  common::setup();

  let option = checker("printf 'wrong answer: token 3 mismatch'; exit 1").build().unwrap();
  let outcome = special_judge(&option).unwrap();
  assert_eq!(outcome.diagnostic(), Some("wrong answer: token 3 mismatch"));
}

#[test]
fn explanation_is_bounded() {
  common::setup();

  let option = checker("i=0; while [ $i -lt 50 ]; do printf 'abcdefghij'; i=$((i+1)); done; exit 1")
    .build()
    .unwrap();
  let outcome = special_judge(&option).unwrap();
  assert_eq!(outcome.diagnostic().map(str::len), Some(100));
}

#[test]
fn crash_is_reported() {
  common::setup();

  let option = checker("kill -SEGV $$").build().unwrap();
  let outcome = special_judge(&option).unwrap();
  assert_eq!(outcome, FlowOutcome::Diagnostic(SPECIAL_CRASH_MESSAGE.to_string()));
}

#[test]
fn checker_reads_its_input() {
  common::setup();

  let dir = tempdir().unwrap();
  let answer = dir.path().join("answer.txt");
  fs::write(&answer, "3\n").unwrap();
  let stdin = File::open(&answer).unwrap();

  let option = checker("read x; [ \"$x\" = 3 ] && exit 0; echo \"got $x\"; exit 1")
    .stdin(stdin.as_raw_fd())
    .build()
    .unwrap();
  assert!(special_judge(&option).unwrap().is_success());
}
