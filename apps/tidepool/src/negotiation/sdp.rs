const LOW_BANDWIDTH_LINE: &str = "b=AS:30";
const HIGH_BANDWIDTH_LINE: &str = "b=AS:102400";

/// Lift the default data bandwidth cap stamped into SDP by stacks that run
/// data channels over RTP. Only the first cap line is rewritten.
pub fn higher_bandwidth_sdp(sdp: &str) -> String {
    let mut rewritten = false;
    let mut out = String::with_capacity(sdp.len() + 8);
    for line in sdp.split_inclusive('\n') {
        let content = line.trim_end_matches(['\r', '\n']);
        if !rewritten && content == LOW_BANDWIDTH_LINE {
            out.push_str(HIGH_BANDWIDTH_LINE);
            out.push_str(&line[content.len()..]);
            rewritten = true;
        } else {
            out.push_str(line);
        }
    }
    out
}
