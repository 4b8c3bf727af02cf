/// The single page served at `/`.
pub const INDEX_HTML: &str = r##"<!doctype html>
<html lang="en"><head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Video Merger</title>
<style>
  body { font-family: system-ui, sans-serif; max-width: 720px; margin: 2rem auto; padding: 0 1rem; color: #222; }
  .card { border: 1px solid #ddd; border-radius: 8px; padding: 1rem 1.25rem; margin-bottom: 1rem; }
  .slot { display: flex; gap: .75rem; align-items: center; margin: .5rem 0; }
  .slot label { min-width: 5.5rem; }
  button { padding: .5rem 1.25rem; border-radius: 6px; border: 1px solid #888; cursor: pointer; }
  button:disabled { opacity: .5; cursor: not-allowed; }
  #status { margin-top: .75rem; min-height: 1.5rem; }
  .info { color: #0b5394; }
  .error { color: #b00; }
  .success { color: #1a7f37; }
  .spinner { display: inline-block; width: 1rem; height: 1rem; border: 2px solid #ccc; border-top-color: #333; border-radius: 50%; animation: spin 1s linear infinite; vertical-align: middle; margin-right: .5rem; }
  progress { width: 100%; }
  @keyframes spin { to { transform: rotate(360deg); } }
</style>
</head><body>
<h1>Video Merger</h1>
<p>Upload between 2 and 5 videos and merge them into one MP4 file.</p>

<form id="merge-form" class="card">
  <div class="slot">
    <label for="count">Number of videos</label>
    <select id="count" name="count">
      <option value="2" selected>2</option>
      <option value="3">3</option>
      <option value="4">4</option>
      <option value="5">5</option>
    </select>
  </div>
  <div id="slots"></div>
  <div class="slot">
    <button id="merge" type="submit" disabled>Merge Videos</button>
    <button id="cancel" type="button" hidden>Cancel</button>
  </div>
  <div id="progress-box" hidden>
    <span class="spinner"></span><span id="progress-text">Merging your videos...</span>
    <progress id="progress" max="100" value="0"></progress>
  </div>
  <div id="status"></div>
  <p id="download" hidden><a id="download-link" href="#" download="merged_video.mp4">Download Merged Video</a></p>
</form>

<script>
const ALLOWED = ["mp4", "mkv", "avi", "mov", "flv", "webm"];
const form = document.getElementById("merge-form");
const countSelect = document.getElementById("count");
const slots = document.getElementById("slots");
const mergeButton = document.getElementById("merge");
const cancelButton = document.getElementById("cancel");
const statusBox = document.getElementById("status");
const progressBox = document.getElementById("progress-box");
const progressBar = document.getElementById("progress");
const progressText = document.getElementById("progress-text");
const downloadBox = document.getElementById("download");
const downloadLink = document.getElementById("download-link");
let running = null;

function showStatus(text, cls) {
  statusBox.textContent = text;
  statusBox.className = cls || "";
}

function extensionOf(name) {
  const dot = name.lastIndexOf(".");
  return dot < 0 ? "" : name.slice(dot + 1).toLowerCase();
}

function renderSlots() {
  const n = Number(countSelect.value);
  slots.innerHTML = "";
  for (let i = 1; i <= n; i++) {
    const row = document.createElement("div");
    row.className = "slot";
    const label = document.createElement("label");
    label.htmlFor = "video_" + i;
    label.textContent = "Video " + i;
    const input = document.createElement("input");
    input.type = "file";
    input.id = "video_" + i;
    input.name = "video_" + i;
    input.accept = ALLOWED.map(e => "." + e).join(",");
    input.addEventListener("change", () => {
      const file = input.files[0];
      if (file && !ALLOWED.includes(extensionOf(file.name))) {
        showStatus("Unsupported video format: " + file.name, "error");
        input.value = "";
      }
      updateGate();
    });
    row.append(label, input);
    slots.append(row);
  }
  updateGate();
}

function filledCount() {
  return Array.from(slots.querySelectorAll("input[type=file]"))
    .filter(input => input.files.length > 0).length;
}

function updateGate() {
  const n = Number(countSelect.value);
  const ready = filledCount() === n;
  mergeButton.disabled = !ready || running !== null;
  if (running === null && !ready) {
    showStatus("Please upload all " + n + " videos to enable merging.", "info");
  } else if (running === null && statusBox.className === "info") {
    showStatus("", "");
  }
}

function setBusy(busy) {
  progressBox.hidden = !busy;
  cancelButton.hidden = !busy;
  countSelect.disabled = busy;
  updateGate();
}

function finish(message, cls) {
  if (running && running.events) running.events.close();
  running = null;
  setBusy(false);
  showStatus(message, cls);
}

function onStatus(job, status) {
  switch (status.state) {
    case "queued":
      progressText.textContent = "Waiting for a free merge slot...";
      break;
    case "staging":
      progressText.textContent = "Preparing uploaded videos...";
      break;
    case "merging":
      progressText.textContent = "Merging video " + status.clip + " of " + status.clips + " (" + status.percent + "%)";
      progressBar.value = status.percent;
      break;
    case "done":
      progressBar.value = 100;
      downloadLink.href = job.download_url;
      downloadBox.hidden = false;
      finish("Videos merged successfully!", "success");
      break;
    case "failed":
      finish("Merge failed (" + status.kind + "): " + status.message + ". You can try again.", "error");
      break;
    case "cancelled":
      finish("Merge cancelled.", "info");
      break;
  }
}

countSelect.addEventListener("change", renderSlots);

form.addEventListener("submit", async (event) => {
  event.preventDefault();
  if (mergeButton.disabled) return;
  downloadBox.hidden = true;
  progressBar.value = 0;
  showStatus("Uploading...", "info");

  const data = new FormData();
  data.append("count", countSelect.value);
  slots.querySelectorAll("input[type=file]").forEach(input => {
    if (input.files[0]) data.append(input.name, input.files[0], input.files[0].name);
  });

  running = { job: null, events: null };
  setBusy(true);
  let response;
  try {
    response = await fetch("/merge", { method: "POST", body: data });
  } catch (err) {
    finish("Upload failed: " + err, "error");
    return;
  }
  const body = await response.json().catch(() => ({ message: response.statusText }));
  if (response.status !== 202) {
    finish(body.message || "Merge request rejected", response.status === 422 ? "info" : "error");
    return;
  }

  showStatus("", "");
  running.job = body;
  running.events = new EventSource(body.events_url);
  running.events.addEventListener("status", (e) => onStatus(body, JSON.parse(e.data)));
  running.events.onerror = () => {
    if (running === null) return;
    fetch(body.status_url)
      .then(r => r.ok ? r.json() : Promise.reject(r.statusText))
      .then(status => onStatus(body, status))
      .catch(() => finish("Lost connection to the merge job.", "error"));
  };
});

cancelButton.addEventListener("click", async () => {
  if (!running || !running.job) return;
  await fetch(running.job.status_url, { method: "DELETE" }).catch(() => {});
});

renderSlots();
</script>
</body></html>
"##;
