//! Pipeline definitions shared by the scenario tests.
//!
//! Step commands are interpreted by [`crate::ScriptedRunner`].

/// `Compile` fanning out to three platform stages.
pub fn fan_out(compile_command: &str) -> String {
    format!(
        r#"
name: fan-out
stages:
  - name: Compile
    jobs:
      - name: compile
        steps:
          - name: build
            run: {compile_command}
  - name: Windows
    depends_on: [Compile]
    jobs:
      - name: package
        steps:
          - name: zip
            run: echo windows
  - name: Linux
    depends_on: [Compile]
    jobs:
      - name: package
        steps:
          - name: tar
            run: echo linux
  - name: macOS
    depends_on: [Compile]
    jobs:
      - name: package
        steps:
          - name: dmg
            run: echo macos
"#
    )
}

/// Two jobs sharing a pool that admits one job at a time.
pub const SERIAL_POOL: &str = r#"
name: serial
pools:
  - name: signing
    max_concurrency: 1
stages:
  - name: Sign
    pool: signing
    jobs:
      - name: first
        steps:
          - name: sign
            run: sleep 60
      - name: second
        steps:
          - name: sign
            run: sleep 60
"#;

/// Six independent jobs on a pool of two.
pub const WIDE_POOL: &str = r#"
name: wide
pools:
  - name: builders
    max_concurrency: 2
stages:
  - name: Build
    pool: builders
    jobs:
      - name: a
        steps: [{ name: work, run: sleep 30 }]
      - name: b
        steps: [{ name: work, run: sleep 30 }]
      - name: c
        steps: [{ name: work, run: sleep 30 }]
      - name: d
        steps: [{ name: work, run: sleep 30 }]
      - name: e
        steps: [{ name: work, run: sleep 30 }]
      - name: f
        steps: [{ name: work, run: sleep 30 }]
"#;

/// A job that never finishes on its own, followed by dependent work.
pub const LONG_RUNNING: &str = r#"
name: long-running
pools:
  - name: serial
    max_concurrency: 1
stages:
  - name: Build
    pool: serial
    jobs:
      - name: soak
        steps:
          - name: wait
            run: hang
      - name: queued
        steps:
          - name: never
            run: echo never
  - name: Deploy
    depends_on: [Build]
    jobs:
      - name: deploy
        steps:
          - name: ship
            run: echo shipping
"#;

/// Every dependency policy against skipped and failed upstream stages.
pub const POLICIES: &str = r#"
name: policies
parameters:
  - name: nightly
    type: boolean
    default: false
stages:
  - name: Nightly
    condition: eq(parameters.nightly, true)
    jobs:
      - name: soak
        steps: [{ name: soak, run: echo soak }]
  - name: Strict
    depends_on: [Nightly]
    jobs:
      - name: report
        steps: [{ name: report, run: echo strict }]
  - name: Lenient
    depends_on: [Nightly]
    dependency_policy: succeeded_or_skipped
    jobs:
      - name: report
        steps: [{ name: report, run: echo lenient }]
  - name: Flaky
    required: false
    jobs:
      - name: smoke
        steps: [{ name: smoke, run: fail 3 }]
  - name: Cleanup
    depends_on: [Flaky]
    dependency_policy: completed
    jobs:
      - name: tidy
        steps: [{ name: tidy, run: echo tidy }]
  - name: Publish
    depends_on: [Flaky]
    required: false
    jobs:
      - name: upload
        steps: [{ name: upload, run: echo upload }]
"#;

/// A stage template instantiated once per platform.
pub const TEMPLATED: &str = r#"
name: templated
parameters:
  - name: quality
    type: enum
    values: [insider, stable]
    default: insider
variables:
  - name: Quality
    expr: parameters.quality
templates:
  platform:
    kind: stage
    parameters:
      - name: os
      - name: arch
        default: x64
    body:
      name: ${{ parameters.os }}
      jobs:
        - name: build_${{ parameters.arch }}
          steps:
            - name: compile
              run: echo building ${{ parameters.os }}-${{ parameters.arch }} $(Quality)
stages:
  - template: platform
    parameters:
      os: Linux
  - template: platform
    parameters:
      os: Windows
      arch: arm64
"#;

/// A variable that reads a parameter nobody declared.
pub const UNDECLARED_PARAMETER: &str = r#"
name: broken
parameters:
  - name: quality
    type: string
    default: insider
variables:
  - name: Channel
    expr: parameters.channel
stages:
  - name: Build
    jobs:
      - name: build
        steps: [{ name: build, run: echo build }]
"#;

/// Stages that depend on each other.
pub const STAGE_CYCLE: &str = r#"
name: cyclic
stages:
  - name: A
    depends_on: [C]
    jobs:
      - name: a
        steps: [{ name: a, run: echo a }]
  - name: B
    depends_on: [A]
    jobs:
      - name: b
        steps: [{ name: b, run: echo b }]
  - name: C
    depends_on: [B]
    jobs:
      - name: c
        steps: [{ name: c, run: echo c }]
"#;

/// Two stages of independent work, used for resumption.
pub const TWO_JOBS: &str = r#"
name: two-jobs
stages:
  - name: Compile
    jobs:
      - name: lint
        steps: [{ name: lint, run: echo lint }]
      - name: build
        steps: [{ name: build, run: echo build }]
  - name: Test
    depends_on: [Compile]
    jobs:
      - name: unit
        steps: [{ name: unit, run: echo unit }]
"#;

/// CI and schedule triggers with a nightly parameter override.
pub const TRIGGERED: &str = r#"
name: triggered
parameters:
  - name: nightly
    type: boolean
    default: false
trigger:
  branches:
    include: [main, "release/*"]
    exclude: ["release/*-dropped-*"]
schedules:
  - cron: "0 5 * * 1-5"
    display_name: Nightly
    branches: { include: [main] }
    parameters: { nightly: true }
stages:
  - name: Build
    jobs:
      - name: build
        steps: [{ name: build, run: echo build }]
  - name: Nightly
    depends_on: [Build]
    condition: eq(parameters.nightly, true)
    jobs:
      - name: soak
        steps: [{ name: soak, run: echo soak }]
"#;
