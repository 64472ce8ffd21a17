//! Full client/node exchange over the in-process transport pair:
//! handshake, sealed task, execution, sealed result, teardown. The
//! executor is a stub; the sandbox itself is covered in the node crate.

use skiff_core::protocol::{ChannelMessage, TaskPayload, TaskResult};
use skiff_core::session::{Action, Role, SessionStateMachine};
use skiff_core::transport::pair::pair;
use skiff_core::transport::Transport;

async fn send_actions<T: Transport>(
    actions: Vec<Action>,
    transport: &T,
    machine: &mut SessionStateMachine,
    execute: &(dyn Fn(TaskPayload) -> TaskResult + Sync),
) -> Option<TaskResult> {
    let mut delivered = None;
    let mut queue = actions;
    while !queue.is_empty() {
        let mut next = Vec::new();
        for action in queue {
            match action {
                Action::Send(message) => {
                    let raw = serde_json::to_vec(&message).unwrap();
                    transport.send(&raw).await.unwrap();
                }
                Action::Execute(task) => {
                    let result = execute(task);
                    next.extend(machine.complete_task(&result).unwrap());
                }
                Action::Deliver(result) => delivered = Some(result),
                Action::Close => {
                    machine.close();
                    transport.close().await;
                }
            }
        }
        queue = next;
    }
    delivered
}

async fn run_node<T: Transport>(
    transport: T,
    execute: impl Fn(TaskPayload) -> TaskResult + Send + Sync + 'static,
) {
    let mut machine = SessionStateMachine::new("it-session", Role::Node);
    machine.begin_signaling();
    let actions = machine.on_channel_open().unwrap();
    send_actions(actions, &transport, &mut machine, &execute).await;

    while let Some(raw) = transport.recv().await {
        let message: ChannelMessage = serde_json::from_slice(&raw).unwrap();
        let actions = machine.handle_message(message).unwrap();
        send_actions(actions, &transport, &mut machine, &execute).await;
        if !transport.is_open() {
            break;
        }
    }
}

async fn run_client<T: Transport>(transport: T, task: TaskPayload) -> TaskResult {
    fn noop(_: TaskPayload) -> TaskResult {
        unreachable!("client never executes")
    }
    let mut machine = SessionStateMachine::new("it-session", Role::Client);
    machine.begin_signaling();
    let actions = machine.on_channel_open().unwrap();
    send_actions(actions, &transport, &mut machine, &noop).await;

    let mut submitted = false;
    while let Some(raw) = transport.recv().await {
        let message: ChannelMessage = serde_json::from_slice(&raw).unwrap();
        let actions = machine.handle_message(message).unwrap();
        if let Some(result) = send_actions(actions, &transport, &mut machine, &noop).await {
            return result;
        }
        if machine.is_ready() && !submitted {
            submitted = true;
            let actions = machine.submit_task(&task).unwrap();
            send_actions(actions, &transport, &mut machine, &noop).await;
        }
    }
    panic!("channel closed before a result arrived");
}

#[tokio::test]
async fn successful_task_round_trip() {
    let (client_end, node_end) = pair();
    let node = tokio::spawn(run_node(node_end, |task| {
        assert_eq!(task.code, "print(1+1)");
        assert_eq!(task.kind, "python_code");
        TaskResult {
            exit_code: 0,
            stdout: "2\n".into(),
            stderr: String::new(),
            execution_time: 0.05,
        }
    }));

    let result = run_client(
        client_end,
        TaskPayload {
            code: "print(1+1)".into(),
            kind: "python_code".into(),
        },
    )
    .await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "2\n");
    assert_eq!(result.stderr, "");
    node.await.unwrap();
}

#[tokio::test]
async fn failing_task_reports_stderr() {
    let (client_end, node_end) = pair();
    let node = tokio::spawn(run_node(node_end, |_| TaskResult {
        exit_code: 1,
        stdout: String::new(),
        stderr: "Traceback (most recent call last):\nRuntimeError: boom\n".into(),
        execution_time: 0.02,
    }));

    let result = run_client(
        client_end,
        TaskPayload {
            code: "raise RuntimeError('boom')".into(),
            kind: "python_code".into(),
        },
    )
    .await;

    assert_ne!(result.exit_code, 0);
    assert!(result.stderr.contains("RuntimeError"));
    assert!(result.stdout.is_empty());
    node.await.unwrap();
}

#[tokio::test]
async fn unavailable_sandbox_result_reaches_client_intact() {
    let (client_end, node_end) = pair();
    let node = tokio::spawn(run_node(node_end, |_| {
        TaskResult::unavailable("isolation runtime unavailable: docker not found", 0.0)
    }));

    let result = run_client(
        client_end,
        TaskPayload {
            code: "print('never runs')".into(),
            kind: "python_code".into(),
        },
    )
    .await;

    assert_eq!(result.exit_code, -1);
    assert!(result.stderr.contains("docker not found"));
    node.await.unwrap();
}
